//! Append-only text log with one line per completed evaluation.
//!
//! Line format: `promoted, tag, accuracy, loss, params, YYYY-mm-dd HH:MM:SS`,
//! with `promoted` written as `1`/`0` and an unknown parameter count as `None`.

use crate::error::StoreError;
use crate::lock::StoreLock;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::io::Write;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One evaluation attempt as recorded in the history file.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub promoted: bool,
    pub tag: String,
    /// Accuracy in percent.
    pub accuracy: f64,
    pub loss: f64,
    pub param_count: Option<u64>,
    pub recorded_at: DateTime<Local>,
}

impl HistoryRecord {
    pub fn new(
        promoted: bool,
        tag: impl Into<String>,
        accuracy: f64,
        loss: f64,
        param_count: Option<u64>,
    ) -> Self {
        Self {
            promoted,
            tag: tag.into(),
            accuracy,
            loss,
            param_count,
            recorded_at: Local::now(),
        }
    }

    /// Render as a history line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let params = self
            .param_count
            .map_or_else(|| "None".to_string(), |p| p.to_string());
        format!(
            "{}, {}, {:?}, {:?}, {}, {}",
            if self.promoted { '1' } else { '0' },
            self.tag,
            self.accuracy,
            self.loss,
            params,
            self.recorded_at.format(TIMESTAMP_FORMAT)
        )
    }

    /// Parse one history line. Tags may contain `", "`, so fields are taken
    /// from both ends.
    pub fn parse_line(line: &str) -> Option<Self> {
        let (promoted, rest) = line.trim_end().split_once(", ")?;
        let promoted = match promoted {
            "1" => true,
            "0" => false,
            _ => return None,
        };
        let mut tail = rest.rsplitn(5, ", ");
        let timestamp = tail.next()?;
        let params = tail.next()?;
        let loss = tail.next()?;
        let accuracy = tail.next()?;
        let tag = tail.next()?;

        let naive = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            promoted,
            tag: tag.to_string(),
            accuracy: accuracy.parse().ok()?,
            loss: loss.parse().ok()?,
            param_count: match params {
                "None" => None,
                p => Some(p.parse().ok()?),
            },
            recorded_at: Local.from_local_datetime(&naive).earliest()?,
        })
    }
}

/// File-backed evaluation history.
#[derive(Debug, Clone)]
pub struct EvaluationHistory {
    path: PathBuf,
    lock: StoreLock,
}

impl EvaluationHistory {
    pub fn new(path: impl Into<PathBuf>, lock: StoreLock) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, creating the file on first use.
    pub fn append(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        writeln!(file, "{}", record.to_line()).map_err(|e| StoreError::io(&self.path, e))?;
        tracing::debug!(tag = %record.tag, promoted = record.promoted, "History record appended");
        Ok(())
    }

    /// Whole file contents, `None` if nothing has been evaluated yet.
    pub fn read_raw(&self) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.acquire()?;
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    /// Parsed records, oldest first. Unparseable lines are skipped.
    pub fn records(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let Some(text) = self.read_raw()? else {
            return Ok(Vec::new());
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| {
                let record = HistoryRecord::parse_line(line);
                if record.is_none() {
                    tracing::warn!(line, "Skipping malformed history line");
                }
                record
            })
            .collect())
    }
}
