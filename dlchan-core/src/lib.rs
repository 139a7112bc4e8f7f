//! # Dlchan Core
//!
//! Core library for the dlchan challenge server.
//! Provides the durable run queue, the score table and its rank snapshots,
//! the live progress channel, the evaluation history, layered configuration
//! and the read-only status gateway.

pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod lock;
pub mod persistence;
pub mod progress;
pub mod queue;
pub mod score;
pub mod stores;

// Re-export commonly used types at the crate root.
pub use config::{DlchanConfig, ShuffleMode, StoragePaths, load_config};
pub use error::{ConfigError, StoreError};
pub use history::{EvaluationHistory, HistoryRecord};
pub use lock::{StoreLock, StoreLockGuard};
pub use progress::{ProgressChannel, ProgressState};
pub use queue::{QueueEntry, RunQueue};
pub use score::{CurvePoint, RankSnapshot, ScoreEntry, ScoreTable, TopSummary};
pub use stores::Stores;
