//! # dlchan-ml: model evaluation for the dlchan challenge server
//!
//! Shapes the held-out evaluation set to each submitted model, loads
//! artifacts through pluggable backends, evaluates them in batches while
//! publishing live rank estimates, and runs the periodic evaluator that
//! commits results to the score table.

// Foundation
pub mod error;

// Data and models
pub mod backends;
pub mod dataset;

// Evaluation pipeline
pub mod evaluation;
pub mod evaluator;
pub mod submission;

// Re-exports
pub use backends::{BatchScore, LoadedModel, ModelBackend, ModelSelector};
pub use dataset::{Batch, Dataset};
pub use error::MlError;
pub use evaluation::{EvaluationOutcome, RunningMean, rank_evaluate};
pub use evaluator::{Evaluator, EvaluatorSettings, EvaluatorState, TickOutcome, model_tag};
pub use submission::{SubmissionReceipt, sanitize_file_name, submit_artifact};
