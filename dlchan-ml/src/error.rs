//! Error types for the dlchan-ml crate.

use dlchan_core::StoreError;
use thiserror::Error;

/// Top-level error type for evaluation and submission.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// No backend accepted the artifact; carries the aggregated rejection text.
    #[error("{0}")]
    Rejected(String),

    #[error("Session ended")]
    DeadlinePassed,

    #[error("model size cannot exceed {:.1} MBytes", megabytes(.limit))]
    TooLarge { size: u64, limit: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn megabytes(bytes: &u64) -> f64 {
    *bytes as f64 / 1024.0 / 1024.0
}

impl MlError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(MlError::DeadlinePassed.to_string(), "Session ended");
        assert_eq!(
            MlError::TooLarge {
                size: 20 << 20,
                limit: 16 << 20
            }
            .to_string(),
            "model size cannot exceed 16.0 MBytes"
        );
        assert_eq!(
            MlError::dataset("empty").to_string(),
            "Dataset error: empty"
        );
    }
}
