//! Batched evaluation with live rank estimates.

use crate::backends::LoadedModel;
use crate::dataset::Dataset;
use crate::error::MlError;
use dlchan_core::{CurvePoint, ProgressChannel, RankSnapshot, ShuffleMode};

/// Sample-weighted running mean over batches of unequal size.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    mean: f64,
    samples: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the mean of a batch of `batch_samples`; returns the new mean.
    pub fn push(&mut self, batch_mean: f64, batch_samples: usize) -> f64 {
        let total = self.samples + batch_samples;
        if total > 0 {
            self.mean = (self.mean * self.samples as f64 + batch_mean * batch_samples as f64)
                / total as f64;
        }
        self.samples = total;
        self.mean
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn samples(&self) -> usize {
        self.samples
    }
}

/// Publishes one progress point per batch, with the rank the running
/// accuracy would currently take.
#[derive(Debug)]
pub struct ProgressReporter<'a> {
    progress: &'a ProgressChannel,
    snapshot: &'a RankSnapshot,
    batches: usize,
    param_count: Option<u64>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(
        progress: &'a ProgressChannel,
        snapshot: &'a RankSnapshot,
        batches: usize,
        param_count: Option<u64>,
    ) -> Self {
        Self {
            progress,
            snapshot,
            batches,
            param_count,
        }
    }

    /// `accuracy` is the running accuracy as a fraction.
    pub fn report(&self, accuracy: f64, batch: usize) {
        let percent = accuracy * 100.0;
        let point = CurvePoint {
            progress: (batch + 1) as f64 / self.batches as f64 * 100.0,
            accuracy: percent,
        };
        let rank = self.snapshot.find_position(percent, self.param_count);
        self.progress
            .publish(point, Some(rank), (batch, self.batches));
    }
}

/// Result of a completed evaluation run. Accuracies are fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub accuracy: f64,
    pub loss: f64,
    /// Running accuracy after each batch.
    pub curve: Vec<f64>,
}

/// Evaluate `model` on `data` in batches of `batch_size`, publishing progress
/// after every batch.
///
/// The set is reordered according to `shuffle` first. Any backend failure
/// ends the run with an error; nothing is committed for it.
pub fn rank_evaluate(
    model: &dyn LoadedModel,
    data: &Dataset,
    snapshot: &RankSnapshot,
    progress: &ProgressChannel,
    batch_size: usize,
    shuffle: ShuffleMode,
) -> Result<EvaluationOutcome, MlError> {
    if data.is_empty() {
        return Err(MlError::evaluation("evaluation set is empty"));
    }
    let data = data.shuffled(shuffle);
    let batches = data.batch_count(batch_size);
    let reporter = ProgressReporter::new(progress, snapshot, batches, model.param_count());

    let mut accuracy = RunningMean::new();
    let mut loss = RunningMean::new();
    let mut curve = Vec::with_capacity(batches);

    for (index, batch) in data.batches(batch_size).enumerate() {
        let score = model.evaluate_batch(&batch)?;
        let running = accuracy.push(score.accuracy, batch.len());
        loss.push(score.loss, batch.len());
        curve.push(running);
        reporter.report(running, index);
        tracing::debug!(
            batch = index + 1,
            batches,
            batch_accuracy = score.accuracy,
            running_accuracy = running,
            "Batch evaluated"
        );
    }

    Ok(EvaluationOutcome {
        accuracy: accuracy.mean(),
        loss: loss.mean(),
        curve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BatchScore;
    use crate::dataset::Batch;
    use std::path::Path;
    use std::sync::Mutex;

    /// Returns pre-set batch accuracies in order.
    struct Scripted {
        scores: Mutex<Vec<f64>>,
        fail_at: Option<usize>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(scores: Vec<f64>) -> Self {
            Self {
                scores: Mutex::new(scores),
                fail_at: None,
                calls: Mutex::new(0),
            }
        }
    }

    impl LoadedModel for Scripted {
        fn backend(&self) -> &str {
            "scripted"
        }
        fn input_geometry(&self) -> &[usize] {
            &[1]
        }
        fn dimensionality(&self) -> usize {
            1
        }
        fn param_count(&self) -> Option<u64> {
            Some(10)
        }
        fn evaluate_batch(&self, _batch: &Batch<'_>) -> Result<BatchScore, MlError> {
            let mut calls = self.calls.lock().unwrap();
            if Some(*calls) == self.fail_at {
                return Err(MlError::evaluation("backend crashed"));
            }
            *calls += 1;
            let accuracy = self.scores.lock().unwrap().remove(0);
            Ok(BatchScore { accuracy, loss: 1.0 - accuracy })
        }
        fn save(&self, _path: &Path) -> Result<(), MlError> {
            Ok(())
        }
        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn dataset(samples: usize) -> Dataset {
        Dataset::from_rows(
            (0..samples).map(|i| vec![i as f64]).collect(),
            (0..samples).map(|_| vec![1.0, 0.0]).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_running_mean_is_sample_weighted() {
        let mut mean = RunningMean::new();
        mean.push(1.0, 32);
        mean.push(0.5, 32);
        mean.push(0.75, 32);
        let last = mean.push(0.0, 10);
        let expected = (32.0 * 1.0 + 32.0 * 0.5 + 32.0 * 0.75) / 106.0;
        assert!((last - expected).abs() < 1e-12);
        assert_eq!(mean.samples(), 106);
    }

    proptest::proptest! {
        #[test]
        fn running_mean_matches_sample_weighted_mean(
            batches in proptest::collection::vec((1usize..64, 0.0f64..=1.0), 1..20),
        ) {
            let mut mean = RunningMean::new();
            for &(samples, accuracy) in &batches {
                mean.push(accuracy, samples);
            }
            let total: usize = batches.iter().map(|&(n, _)| n).sum();
            let expected = batches
                .iter()
                .map(|&(n, a)| a * n as f64)
                .sum::<f64>()
                / total as f64;
            proptest::prop_assert!((mean.mean() - expected).abs() < 1e-9);
            proptest::prop_assert_eq!(mean.samples(), total);
        }
    }

    #[test]
    fn test_rank_evaluate_uneven_batches() {
        let model = Scripted::new(vec![1.0, 0.5, 0.75, 0.0]);
        let progress = ProgressChannel::new();
        progress.reset("m");
        let snapshot = RankSnapshot::new(vec![(80.0, Some(5)), (60.0, Some(5))]);

        let outcome = rank_evaluate(
            &model,
            &dataset(106),
            &snapshot,
            &progress,
            32,
            ShuffleMode::Disabled,
        )
        .unwrap();

        let expected = (32.0 + 16.0 + 24.0) / 106.0;
        assert!((outcome.accuracy - expected).abs() < 1e-12);
        assert_eq!(outcome.curve.len(), 4);
        assert_eq!(outcome.curve[0], 1.0);
        assert_eq!(outcome.curve[1], 0.75);

        let state = progress.snapshot();
        assert_eq!(state.series.len(), 4);
        assert_eq!(state.series[0].progress, 25.0);
        assert_eq!(state.series[3].progress, 100.0);
        assert_eq!(state.series[0].accuracy, 100.0);
        assert_eq!(state.batch, (3, 4));
        // ~67.9% sits between the two stored entries.
        assert_eq!(state.rank, Some(2));
    }

    #[test]
    fn test_rank_evaluate_backend_failure() {
        let mut model = Scripted::new(vec![1.0, 1.0, 1.0]);
        model.fail_at = Some(1);
        let progress = ProgressChannel::new();
        let result = rank_evaluate(
            &model,
            &dataset(70),
            &RankSnapshot::default(),
            &progress,
            32,
            ShuffleMode::Disabled,
        );
        assert!(matches!(result, Err(MlError::Evaluation(_))));
        assert_eq!(progress.series().len(), 1);
    }

    #[test]
    fn test_rank_evaluate_empty_set() {
        let model = Scripted::new(vec![]);
        let empty = Dataset::new(vec![], vec![1], vec![], 2).unwrap();
        let result = rank_evaluate(
            &model,
            &empty,
            &RankSnapshot::default(),
            &ProgressChannel::new(),
            32,
            ShuffleMode::Disabled,
        );
        assert!(result.is_err());
    }
}
