//! Persisted leaderboard: best result per submission tag, sorted by accuracy
//! then by parameter count.
//!
//! Two locks guard the table:
//!
//! - the **evaluation lock** serialises every mutation with the evaluator,
//!   which holds it from dequeue to commit (it is reentrant, so the evaluator
//!   can call [`ScoreTable::update`] while holding it);
//! - the **file lock** is held only while the file is read or replaced.
//!
//! Readers take only the file lock. Writes replace the whole file, so a reader
//! sees the table either before or after an update.

use crate::error::StoreError;
use crate::lock::StoreLock;
use crate::persistence::{atomic_write_json, load_or_default};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Best known result of one submission tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub tag: String,
    /// Accuracy in percent, `[0, 100]`.
    pub accuracy: f64,
    /// Evaluation loss; `NaN` when the backend reported none usable.
    #[serde(with = "loss_serde")]
    pub loss: f64,
    /// Trainable parameter count, `None` when the backend cannot tell.
    pub param_count: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// One sample of an accuracy-vs-progress curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Evaluation progress in percent, `[0, 100]`.
    pub progress: f64,
    /// Accuracy in percent.
    pub accuracy: f64,
}

/// Leader of the table together with its evaluation curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopSummary {
    pub tag: Option<String>,
    pub curve: Vec<CurvePoint>,
    pub entry: Option<ScoreEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    updated_at: DateTime<Utc>,
    #[serde(default)]
    leader_curve: Vec<CurvePoint>,
    #[serde(default)]
    entries: Vec<ScoreEntry>,
}

impl Default for TableFile {
    fn default() -> Self {
        Self {
            updated_at: Utc::now(),
            leader_curve: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// Whether a candidate result replaces the stored one for the same tag.
///
/// Higher accuracy wins; equal accuracy is won by strictly fewer parameters,
/// where an unknown count compares as infinitely many.
pub fn dominates(
    candidate_accuracy: f64,
    candidate_params: Option<u64>,
    stored_accuracy: f64,
    stored_params: Option<u64>,
) -> bool {
    candidate_accuracy > stored_accuracy
        || (candidate_accuracy == stored_accuracy
            && params_or_infinity(candidate_params) < params_or_infinity(stored_params))
}

fn params_or_infinity(params: Option<u64>) -> f64 {
    params.map_or(f64::INFINITY, |p| p as f64)
}

/// Table order: accuracy descending, then parameter count ascending with
/// unknown counts last.
fn standing_order(a: &ScoreEntry, b: &ScoreEntry) -> Ordering {
    b.accuracy
        .total_cmp(&a.accuracy)
        .then_with(|| match (a.param_count, b.param_count) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Spread `accuracies` evenly over a `[0, 100]` progress axis.
pub fn resample_curve(accuracies: &[f64]) -> Vec<CurvePoint> {
    let last = accuracies.len().saturating_sub(1);
    accuracies
        .iter()
        .enumerate()
        .map(|(i, &accuracy)| CurvePoint {
            progress: if last == 0 {
                0.0
            } else {
                100.0 * i as f64 / last as f64
            },
            accuracy,
        })
        .collect()
}

/// File-backed score table.
#[derive(Debug, Clone)]
pub struct ScoreTable {
    path: PathBuf,
    file_lock: StoreLock,
    evaluation_lock: StoreLock,
}

impl ScoreTable {
    pub fn new(path: impl Into<PathBuf>, file_lock: StoreLock, evaluation_lock: StoreLock) -> Self {
        Self {
            path: path.into(),
            file_lock,
            evaluation_lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock that serialises evaluation runs with table mutations.
    pub fn evaluation_lock(&self) -> &StoreLock {
        &self.evaluation_lock
    }

    /// Record a result for `tag`. Returns `true` when it was inserted or
    /// replaced the stored entry, `false` when the stored entry dominates.
    ///
    /// `accuracy_curve` holds the running accuracy (percent) after each
    /// evaluated batch; it becomes the leader curve if `tag` ends up first.
    pub fn update(
        &self,
        tag: &str,
        accuracy: f64,
        loss: f64,
        param_count: Option<u64>,
        accuracy_curve: &[f64],
    ) -> Result<bool, StoreError> {
        let _evaluation = self.evaluation_lock.acquire()?;
        let mut table = self.read()?;

        let candidate = ScoreEntry {
            tag: tag.to_string(),
            accuracy,
            loss,
            param_count,
            updated_at: Utc::now(),
        };

        match table.entries.iter_mut().find(|e| e.tag == tag) {
            None => table.entries.push(candidate),
            Some(stored) => {
                if !dominates(accuracy, param_count, stored.accuracy, stored.param_count) {
                    tracing::debug!(
                        tag,
                        accuracy,
                        stored_accuracy = stored.accuracy,
                        "Result does not beat the stored entry"
                    );
                    return Ok(false);
                }
                *stored = candidate;
            }
        }

        table.entries.sort_by(standing_order);
        if table.entries.first().is_some_and(|e| e.tag == tag) {
            table.leader_curve = resample_curve(accuracy_curve);
        }
        table.updated_at = Utc::now();
        self.write(&table)?;
        tracing::info!(tag, accuracy, ?param_count, "Score table updated");
        Ok(true)
    }

    /// All entries in table order.
    pub fn get(&self) -> Result<Vec<ScoreEntry>, StoreError> {
        Ok(self.read()?.entries)
    }

    /// `(accuracy, param_count)` pairs in table order, for in-flight rank estimates.
    pub fn rank_snapshot(&self) -> Result<RankSnapshot, StoreError> {
        let table = self.read()?;
        Ok(RankSnapshot::new(
            table
                .entries
                .iter()
                .map(|e| (e.accuracy, e.param_count))
                .collect(),
        ))
    }

    /// 1-based position of `tag`, `None` if it is not in the table.
    pub fn find_position(&self, tag: &str) -> Result<Option<usize>, StoreError> {
        let table = self.read()?;
        Ok(table
            .entries
            .iter()
            .position(|e| e.tag == tag)
            .map(|i| i + 1))
    }

    /// Leader tag, leader curve and leader entry.
    pub fn top_summary(&self) -> Result<TopSummary, StoreError> {
        let table = self.read()?;
        let entry = table.entries.into_iter().next();
        Ok(TopSummary {
            tag: entry.as_ref().map(|e| e.tag.clone()),
            curve: if entry.is_some() {
                table.leader_curve
            } else {
                Vec::new()
            },
            entry,
        })
    }

    /// Time of the last persisted change.
    pub fn updated_at(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(self.read()?.updated_at)
    }

    /// Keep only the first `keep` entries. Returns how many were removed.
    pub fn retain_top(&self, keep: usize) -> Result<usize, StoreError> {
        let _evaluation = self.evaluation_lock.acquire()?;
        let mut table = self.read()?;
        if table.entries.len() <= keep {
            return Ok(0);
        }
        let removed = table.entries.len() - keep;
        table.entries.truncate(keep);
        if table.entries.is_empty() {
            table.leader_curve.clear();
        }
        table.updated_at = Utc::now();
        self.write(&table)?;
        tracing::info!(removed, keep, "Score table pruned");
        Ok(removed)
    }

    fn read(&self) -> Result<TableFile, StoreError> {
        let _file = self.file_lock.acquire()?;
        Ok(load_or_default(&self.path, "score table"))
    }

    fn write(&self, table: &TableFile) -> Result<(), StoreError> {
        let _file = self.file_lock.acquire()?;
        atomic_write_json(&self.path, table)
    }
}

/// Point-in-time copy of the table ordering, taken once per evaluation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankSnapshot {
    ranks: Vec<(f64, Option<u64>)>,
}

impl RankSnapshot {
    /// `ranks` must already be in table order.
    pub fn new(ranks: Vec<(f64, Option<u64>)>) -> Self {
        Self { ranks }
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// 1-based position an in-flight result would take in the table.
    ///
    /// Unknown parameter counts count as 0 on both sides here, unlike the
    /// table's own ordering where they count as infinitely many. An unknown
    /// candidate is therefore not pushed down while it is still running.
    pub fn find_position(&self, accuracy: f64, param_count: Option<u64>) -> usize {
        let params = param_count.unwrap_or(0);
        let mut position = 1;
        for &(stored_accuracy, stored_params) in &self.ranks {
            let stored_params = stored_params.unwrap_or(0);
            if stored_accuracy < accuracy
                || (stored_accuracy == accuracy && stored_params >= params)
            {
                break;
            }
            position += 1;
        }
        position
    }
}

mod loss_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(loss: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if loss.is_finite() {
            serializer.serialize_some(loss)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
