//! Durable FIFO of submitted model artifacts waiting for evaluation.
//!
//! The queue file is the only source of truth. Every operation takes the
//! queue lock, reloads the file, mutates and writes back before releasing it,
//! so request handlers in other processes never lose each other's updates.

use crate::error::StoreError;
use crate::lock::StoreLock;
use crate::persistence::{atomic_write_json, load_or_default};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One waiting submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Artifact file name inside the upload directory.
    pub reference: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    entries: Vec<QueueEntry>,
}

/// File-backed run queue.
#[derive(Debug, Clone)]
pub struct RunQueue {
    path: PathBuf,
    lock: StoreLock,
}

impl RunQueue {
    pub fn new(path: impl Into<PathBuf>, lock: StoreLock) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a reference to the end of the queue.
    pub fn enqueue(&self, reference: &str) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        let mut queue = self.read();
        queue.entries.push(QueueEntry {
            reference: reference.to_string(),
            submitted_at: Utc::now(),
        });
        self.write(&queue)?;
        tracing::debug!(reference, waiting = queue.entries.len(), "Submission queued");
        Ok(())
    }

    /// Remove and return the oldest reference, or `None` when empty.
    pub fn dequeue_one(&self) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.acquire()?;
        let mut queue = self.read();
        if queue.entries.is_empty() {
            return Ok(None);
        }
        let entry = queue.entries.remove(0);
        self.write(&queue)?;
        Ok(Some(entry.reference))
    }

    /// References currently waiting, oldest first.
    pub fn waiting(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .waiting_entries()?
            .into_iter()
            .map(|e| e.reference)
            .collect())
    }

    /// Waiting entries with their submission time, oldest first.
    pub fn waiting_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let _guard = self.lock.acquire()?;
        Ok(self.read().entries)
    }

    /// Drop every waiting entry.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        self.write(&QueueFile::default())
    }

    fn read(&self) -> QueueFile {
        load_or_default(&self.path, "run queue")
    }

    fn write(&self, queue: &QueueFile) -> Result<(), StoreError> {
        atomic_write_json(&self.path, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_queue(dir: &TempDir) -> RunQueue {
        RunQueue::new(
            dir.path().join("runqueue.json"),
            StoreLock::new(dir.path().join("queue.lock")),
        )
    }

    #[test]
    fn test_fifo_order() {
        let dir = TempDir::new().unwrap();
        let queue = make_queue(&dir);
        queue.enqueue("cnn1.nn").unwrap();
        queue.enqueue("cnn2.nn").unwrap();
        queue.enqueue("svm.clf").unwrap();

        assert_eq!(
            queue.waiting().unwrap(),
            vec!["cnn1.nn", "cnn2.nn", "svm.clf"]
        );
        assert_eq!(queue.dequeue_one().unwrap().as_deref(), Some("cnn1.nn"));
        assert_eq!(queue.dequeue_one().unwrap().as_deref(), Some("cnn2.nn"));
        assert_eq!(queue.dequeue_one().unwrap().as_deref(), Some("svm.clf"));
        assert_eq!(queue.dequeue_one().unwrap(), None);
    }

    #[test]
    fn test_empty_when_missing() {
        let dir = TempDir::new().unwrap();
        let queue = make_queue(&dir);
        assert!(queue.waiting().unwrap().is_empty());
        assert_eq!(queue.dequeue_one().unwrap(), None);
        // Dequeuing from an empty queue does not create the file.
        assert!(!queue.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_treated_as_empty_and_rewritten() {
        let dir = TempDir::new().unwrap();
        let queue = make_queue(&dir);
        std::fs::write(queue.path(), b"\x00\x01garbage").unwrap();

        assert!(queue.waiting().unwrap().is_empty());
        queue.enqueue("model.nn").unwrap();
        assert_eq!(queue.waiting().unwrap(), vec!["model.nn"]);
    }

    #[test]
    fn test_waiting_entries_carry_timestamps() {
        let dir = TempDir::new().unwrap();
        let queue = make_queue(&dir);
        let before = Utc::now();
        queue.enqueue("a.nn").unwrap();
        queue.enqueue("b.nn").unwrap();

        let entries = queue.waiting_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].submitted_at >= before);
        assert!(entries[0].submitted_at <= entries[1].submitted_at);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let queue = make_queue(&dir);
        queue.enqueue("a.nn").unwrap();
        queue.clear().unwrap();
        assert!(queue.waiting().unwrap().is_empty());
    }

    #[test]
    fn test_independent_handles_see_each_other() {
        let dir = TempDir::new().unwrap();
        let web = make_queue(&dir);
        let worker = make_queue(&dir);

        web.enqueue("first.nn").unwrap();
        worker.enqueue("second.nn").unwrap();
        assert_eq!(web.dequeue_one().unwrap().as_deref(), Some("first.nn"));
        assert_eq!(worker.waiting().unwrap(), vec!["second.nn"]);
    }
}
