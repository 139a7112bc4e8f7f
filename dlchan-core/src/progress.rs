//! Live progress of the evaluation currently running.
//!
//! One producer (the evaluator) publishes after every batch; any number of
//! status readers take snapshots. All methods hold the internal mutex for a
//! few field copies only.

use crate::score::CurvePoint;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Consistent copy of the progress fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressState {
    /// Tag of the model being (or last) evaluated; empty before the first run.
    pub tag: String,
    /// `(progress %, running accuracy %)` after each batch.
    pub series: Vec<CurvePoint>,
    /// Estimated or final 1-based table position, `None` when unknown.
    pub rank: Option<usize>,
    /// `(current batch index, total batches)`.
    pub batch: (usize, usize),
    /// Latched once the run has reached a terminal state.
    pub complete: bool,
}

/// Shared progress record.
#[derive(Debug, Default)]
pub struct ProgressChannel {
    state: Mutex<ProgressState>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a new evaluation of `tag`.
    pub fn reset(&self, tag: &str) {
        let mut state = self.state();
        *state = ProgressState {
            tag: tag.to_string(),
            ..ProgressState::default()
        };
    }

    /// Forget the current run, tag included.
    pub fn clear(&self) {
        *self.state() = ProgressState::default();
    }

    /// Append one point and replace the rank estimate and batch counter.
    pub fn publish(&self, point: CurvePoint, rank: Option<usize>, batch: (usize, usize)) {
        let mut state = self.state();
        state.series.push(point);
        state.rank = rank;
        state.batch = batch;
    }

    pub fn set_rank(&self, rank: Option<usize>) {
        self.state().rank = rank;
    }

    pub fn set_complete(&self, complete: bool) {
        self.state().complete = complete;
    }

    pub fn tag(&self) -> String {
        self.state().tag.clone()
    }

    pub fn series(&self) -> Vec<CurvePoint> {
        self.state().series.clone()
    }

    pub fn rank(&self) -> Option<usize> {
        self.state().rank
    }

    pub fn batch(&self) -> (usize, usize) {
        self.state().batch
    }

    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    pub fn snapshot(&self) -> ProgressState {
        self.state().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reset_clears_previous_run() {
        let progress = ProgressChannel::new();
        progress.reset("first");
        progress.publish(
            CurvePoint {
                progress: 50.0,
                accuracy: 80.0,
            },
            Some(3),
            (0, 2),
        );
        progress.set_complete(true);

        progress.reset("second");
        assert_eq!(
            progress.snapshot(),
            ProgressState {
                tag: "second".into(),
                ..ProgressState::default()
            }
        );
    }

    #[test]
    fn test_publish_accumulates_series() {
        let progress = ProgressChannel::new();
        progress.reset("m");
        for b in 0..4 {
            progress.publish(
                CurvePoint {
                    progress: (b + 1) as f64 * 25.0,
                    accuracy: 90.0,
                },
                Some(b + 1),
                (b, 4),
            );
        }
        assert_eq!(progress.series().len(), 4);
        assert_eq!(progress.rank(), Some(4));
        assert_eq!(progress.batch(), (3, 4));
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_set_rank_and_clear() {
        let progress = ProgressChannel::new();
        progress.reset("m");
        progress.set_rank(Some(2));
        assert_eq!(progress.rank(), Some(2));
        progress.clear();
        assert_eq!(progress.tag(), "");
        assert_eq!(progress.rank(), None);
    }

    #[test]
    fn test_snapshot_is_consistent_under_concurrent_publish() {
        let progress = Arc::new(ProgressChannel::new());
        progress.reset("m");
        let writer = {
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                for b in 0..200 {
                    progress.publish(
                        CurvePoint {
                            progress: b as f64,
                            accuracy: 1.0,
                        },
                        Some(b),
                        (b, 200),
                    );
                }
            })
        };
        for _ in 0..200 {
            let snap = progress.snapshot();
            // Each publish updates series length and batch index together.
            if let Some(last) = snap.series.last() {
                assert_eq!(snap.series.len(), snap.batch.0 + 1);
                assert_eq!(last.progress as usize, snap.batch.0);
            }
        }
        writer.join().unwrap();
    }
}
