//! The evaluator: a periodic worker that takes one queued submission per
//! tick, evaluates it and commits the result.
//!
//! One tick walks `Idle → Dequeuing → ReshapingInput → Evaluating →
//! Committing → Promoted | Discarded → Idle`. The evaluation lock of the
//! score table is held from dequeue to commit, so no table mutation can
//! interleave with a running evaluation. Entries that cannot be evaluated
//! leave the table untouched and their artifact in the upload directory.

use crate::backends::{LoadedModel, ModelSelector};
use crate::dataset::Dataset;
use crate::error::MlError;
use crate::evaluation::rank_evaluate;
use dlchan_core::config::{DlchanConfig, StoragePaths};
use dlchan_core::{HistoryRecord, ProgressChannel, ShuffleMode, Stores};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Where the evaluator is within one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
    Idle,
    Dequeuing,
    ReshapingInput,
    Evaluating,
    Committing,
    Promoted,
    Discarded,
}

impl std::fmt::Display for EvaluatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluatorState::Idle => write!(f, "idle"),
            EvaluatorState::Dequeuing => write!(f, "dequeuing"),
            EvaluatorState::ReshapingInput => write!(f, "reshaping_input"),
            EvaluatorState::Evaluating => write!(f, "evaluating"),
            EvaluatorState::Committing => write!(f, "committing"),
            EvaluatorState::Promoted => write!(f, "promoted"),
            EvaluatorState::Discarded => write!(f, "discarded"),
        }
    }
}

/// How one tick ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    QueueEmpty,
    /// No backend recognised the queued artifact.
    Rejected { reference: String },
    /// The model input is neither 1-D nor 2-D.
    Unsupported { tag: String, dimensionality: usize },
    /// Reshaping or evaluation failed.
    Failed { tag: String, error: String },
    /// The result entered or improved the table; the artifact was kept.
    Promoted { tag: String, accuracy: f64 },
    /// The stored result was better; the artifact was deleted.
    Discarded {
        tag: String,
        accuracy: f64,
        position: Option<usize>,
    },
}

/// Tag of a queued artifact: its file name without the last extension.
pub fn model_tag(reference: &str) -> &str {
    reference
        .rsplit_once('.')
        .map_or(reference, |(stem, _)| stem)
}

/// Everything a tick needs besides the stores.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorSettings {
    pub upload_dir: PathBuf,
    pub best_models_dir: PathBuf,
    /// Used when the evaluation labels are not one-hot.
    pub classes: usize,
    pub channels: usize,
    /// Stacked maps of 2-D models that do not declare their own.
    pub maps: usize,
    pub batch_size: usize,
    pub shuffle: ShuffleMode,
    pub period: Duration,
}

impl EvaluatorSettings {
    pub fn from_config(config: &DlchanConfig, paths: &StoragePaths) -> Self {
        Self {
            upload_dir: paths.upload_dir.clone(),
            best_models_dir: paths.best_models_dir.clone(),
            classes: config.dataset.classes,
            channels: config.dataset.channels,
            maps: config.dataset.maps,
            batch_size: config.evaluation.batch_size,
            shuffle: config.evaluation.shuffle_mode(),
            period: Duration::from_secs(config.evaluation.period_secs),
        }
    }
}

pub struct Evaluator {
    selector: ModelSelector,
    stores: Stores,
    progress: Arc<ProgressChannel>,
    dataset: Dataset,
    classes: usize,
    settings: EvaluatorSettings,
    state: Mutex<EvaluatorState>,
}

impl Evaluator {
    pub fn new(
        settings: EvaluatorSettings,
        dataset: Dataset,
        selector: ModelSelector,
        stores: Stores,
        progress: Arc<ProgressChannel>,
    ) -> Self {
        let classes = dataset.num_classes(settings.classes);
        Self {
            selector,
            stores,
            progress,
            dataset,
            classes,
            settings,
            state: Mutex::new(EvaluatorState::Idle),
        }
    }

    /// Build from configuration, loading the evaluation set from disk.
    pub fn from_config(
        config: &DlchanConfig,
        paths: &StoragePaths,
        selector: ModelSelector,
        stores: Stores,
        progress: Arc<ProgressChannel>,
    ) -> Result<Self, MlError> {
        let dataset = Dataset::from_file(&paths.eval_dataset)?;
        Ok(Self::new(
            EvaluatorSettings::from_config(config, paths),
            dataset,
            selector,
            stores,
            progress,
        ))
    }

    pub fn state(&self) -> EvaluatorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    fn transition(&self, next: EvaluatorState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(from = %*state, to = %next, "Evaluator state");
        *state = next;
    }

    /// Run one full cycle: take at most one queued entry and see it through.
    pub fn tick(&self) -> Result<TickOutcome, MlError> {
        if self.progress.is_complete() {
            self.progress.set_complete(false);
        }
        let outcome = self.run_once();
        self.transition(EvaluatorState::Idle);
        outcome
    }

    fn run_once(&self) -> Result<TickOutcome, MlError> {
        self.transition(EvaluatorState::Dequeuing);
        let _evaluation = self.stores.table.evaluation_lock().acquire()?;
        let Some(reference) = self.stores.queue.dequeue_one()? else {
            return Ok(TickOutcome::QueueEmpty);
        };
        let tag = model_tag(&reference).to_string();
        let artifact = self.settings.upload_dir.join(&reference);
        tracing::info!(reference, tag, "Evaluating submission");
        self.progress.reset(&tag);
        let snapshot = self.stores.table.rank_snapshot()?;

        self.transition(EvaluatorState::ReshapingInput);
        let Some(model) = self.selector.from_file(&artifact) else {
            tracing::warn!(reference, "Queued artifact could not be loaded by any backend");
            self.progress.set_complete(true);
            return Ok(TickOutcome::Rejected { reference });
        };
        tracing::info!(tag, backend = model.backend(), model = %model.describe(), "Model loaded");

        let data = match self.reshape_for(model.as_ref()) {
            Ok(Some(data)) => data,
            Ok(None) => {
                let dimensionality = model.dimensionality();
                tracing::warn!(tag, dimensionality, "Model input is neither 1-D nor 2-D, skipping");
                self.progress.set_complete(true);
                return Ok(TickOutcome::Unsupported {
                    tag,
                    dimensionality,
                });
            }
            Err(e) => return Ok(self.failed(tag, e)),
        };
        tracing::info!(tag, samples = data.samples(), shape = ?data.sample_shape(), "Evaluation set reshaped");

        self.transition(EvaluatorState::Evaluating);
        let outcome = match rank_evaluate(
            model.as_ref(),
            &data,
            &snapshot,
            &self.progress,
            self.settings.batch_size,
            self.settings.shuffle,
        ) {
            Ok(outcome) => outcome,
            Err(e) => return Ok(self.failed(tag, e)),
        };

        self.transition(EvaluatorState::Committing);
        let accuracy = outcome.accuracy * 100.0;
        let curve: Vec<f64> = outcome.curve.iter().map(|a| a * 100.0).collect();
        let params = model.param_count();
        let promoted = self
            .stores
            .table
            .update(&tag, accuracy, outcome.loss, params, &curve)?;
        // The table is committed; the remaining steps only log their failures.
        if let Err(e) = self.stores.history.append(&HistoryRecord::new(
            promoted,
            &tag,
            accuracy,
            outcome.loss,
            params,
        )) {
            tracing::warn!(tag, error = %e, "Could not append to the evaluation history");
        }

        let result = if promoted {
            self.transition(EvaluatorState::Promoted);
            self.keep_artifact(&artifact, &reference);
            tracing::info!(tag, accuracy, "Submission promoted");
            TickOutcome::Promoted { tag, accuracy }
        } else {
            self.transition(EvaluatorState::Discarded);
            let position = self.stores.table.find_position(&tag).unwrap_or_else(|e| {
                tracing::warn!(tag, error = %e, "Could not look up the stored position");
                None
            });
            self.progress.set_rank(position);
            if let Err(e) = std::fs::remove_file(&artifact) {
                tracing::warn!(path = %artifact.display(), error = %e, "Could not delete discarded artifact");
            }
            tracing::info!(tag, accuracy, ?position, "Submission discarded");
            TickOutcome::Discarded {
                tag,
                accuracy,
                position,
            }
        };
        self.progress.set_complete(true);
        Ok(result)
    }

    /// Reshape the evaluation set to the model's input. `Ok(None)` when the
    /// model dimensionality is not supported.
    fn reshape_for(&self, model: &dyn LoadedModel) -> Result<Option<Dataset>, MlError> {
        let geometry = model.input_geometry();
        let Some(&points) = geometry.first() else {
            return Err(MlError::model("model declares no input geometry"));
        };
        let channels = self.settings.channels;
        match model.dimensionality() {
            1 => {
                let per_channel = points.checked_div(channels).ok_or_else(|| {
                    MlError::model("cannot split the model input into 0 channels")
                })?;
                Ok(Some(self.dataset.shape_per_class(
                    self.classes,
                    channels,
                    per_channel,
                )?))
            }
            2 => {
                let maps = geometry.get(2).copied().unwrap_or(self.settings.maps);
                let shaped = self.dataset.shape_per_class(self.classes, channels, points)?;
                Ok(Some(shaped.split_stack_channels(channels, maps)?))
            }
            _ => Ok(None),
        }
    }

    fn failed(&self, tag: String, error: MlError) -> TickOutcome {
        tracing::warn!(tag, error = %error, "Evaluation failed, artifact left for inspection");
        self.progress.set_complete(true);
        TickOutcome::Failed {
            tag,
            error: error.to_string(),
        }
    }

    fn keep_artifact(&self, artifact: &Path, reference: &str) {
        let target = self.settings.best_models_dir.join(reference);
        let moved = std::fs::create_dir_all(&self.settings.best_models_dir)
            .and_then(|()| move_file(artifact, &target));
        match moved {
            Ok(()) => tracing::info!(path = %target.display(), "Best model stored"),
            Err(e) => tracing::warn!(
                from = %artifact.display(),
                to = %target.display(),
                error = %e,
                "Could not move promoted artifact"
            ),
        }
    }

    /// Tick every `period` until `shutdown` fires. Ticks run on the blocking
    /// pool; a failed tick is logged and the loop carries on.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; wait a full period first.
        interval.tick().await;
        tracing::info!(period = ?self.settings.period, "Evaluator started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let evaluator = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || evaluator.tick()).await {
                Ok(Ok(TickOutcome::QueueEmpty)) => {}
                Ok(Ok(outcome)) => tracing::debug!(?outcome, "Tick finished"),
                Ok(Err(e)) => tracing::error!(error = %e, "Evaluator tick failed"),
                Err(e) => tracing::error!(error = %e, "Evaluator tick panicked"),
            }
        }
        tracing::info!("Evaluator stopped");
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("selector", &self.selector)
            .field("samples", &self.dataset.samples())
            .field("classes", &self.classes)
            .field("settings", &self.settings)
            .field("state", &self.state())
            .finish()
    }
}

/// Rename, falling back to copy and delete across file systems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_tag() {
        assert_eq!(model_tag("cnn1.nn"), "cnn1");
        assert_eq!(model_tag("v2.final.clf"), "v2.final");
        assert_eq!(model_tag("modelA.h5"), "modelA");
        assert_eq!(model_tag("noext"), "noext");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EvaluatorState::ReshapingInput.to_string(), "reshaping_input");
        assert_eq!(EvaluatorState::Idle.to_string(), "idle");
    }
}
