//! The set of file-backed stores one deployment works on.

use crate::config::StoragePaths;
use crate::history::EvaluationHistory;
use crate::lock::StoreLock;
use crate::queue::RunQueue;
use crate::score::ScoreTable;

/// Handles on the run queue, score table and evaluation history of one
/// deployment. Cheap to clone; clones share their in-process locks.
#[derive(Debug, Clone)]
pub struct Stores {
    pub queue: RunQueue,
    pub table: ScoreTable,
    pub history: EvaluationHistory,
}

impl Stores {
    pub fn open(paths: &StoragePaths) -> Self {
        Self {
            queue: RunQueue::new(&paths.queue_file, StoreLock::new(&paths.queue_lock)),
            table: ScoreTable::new(
                &paths.score_file,
                StoreLock::new(&paths.score_lock),
                StoreLock::new(&paths.evaluation_lock),
            ),
            history: EvaluationHistory::new(
                &paths.history_file,
                StoreLock::new(&paths.history_lock),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DlchanConfig;

    #[test]
    fn test_open_uses_configured_locations() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DlchanConfig::default().paths(dir.path());
        let stores = Stores::open(&paths);

        stores.queue.enqueue("m.nn").unwrap();
        stores.table.update("m", 10.0, 0.5, Some(3), &[10.0]).unwrap();
        assert!(paths.queue_file.exists());
        assert!(paths.score_file.exists());
        assert_eq!(stores.queue.path(), paths.queue_file);
        assert_eq!(stores.history.path(), paths.history_file);
    }
}
