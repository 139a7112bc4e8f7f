//! Model backend traits, registration-ordered selection and implementations.

pub mod classical;
pub mod neural;

pub use classical::ClassicalBackend;
pub use neural::NeuralNetworkBackend;

use crate::dataset::Batch;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Accuracy (fraction in `[0, 1]`) and loss of one evaluated batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchScore {
    pub accuracy: f64,
    pub loss: f64,
}

/// A model family that can recognise and load artifacts.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Load `path`, failing if the artifact does not belong to this backend.
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>, MlError>;

    /// Whether `path` is an artifact this backend can load.
    fn validate(&self, path: &Path) -> bool {
        self.load(path).is_ok()
    }

    /// Shown to submitters when no backend accepts their artifact.
    fn rejection_message(&self) -> String;
}

/// A model ready to be evaluated.
pub trait LoadedModel: Send {
    /// Name of the backend that loaded the model.
    fn backend(&self) -> &str;

    /// Input shape without the batch dimension.
    fn input_geometry(&self) -> &[usize];

    /// 1 for flat inputs, 2 for `[points, channels, maps]` inputs.
    fn dimensionality(&self) -> usize;

    /// Trainable parameters, `None` when the model family has no such notion.
    fn param_count(&self) -> Option<u64>;

    fn evaluate_batch(&self, batch: &Batch<'_>) -> Result<BatchScore, MlError>;

    /// Score a whole dataset at once.
    fn score(&self, data: &Batch<'_>) -> Result<BatchScore, MlError> {
        self.evaluate_batch(data)
    }

    /// Write the model back in its artifact format.
    fn save(&self, path: &Path) -> Result<(), MlError>;

    fn describe(&self) -> String;
}

/// Ordered set of backends; the first that loads an artifact wins.
pub struct ModelSelector {
    backends: Vec<Box<dyn ModelBackend>>,
}

impl ModelSelector {
    pub fn new(backends: Vec<Box<dyn ModelBackend>>) -> Self {
        Self { backends }
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Load `path` with the first backend that accepts it.
    pub fn from_file(&self, path: &Path) -> Option<Box<dyn LoadedModel>> {
        for backend in &self.backends {
            match backend.load(path) {
                Ok(model) => {
                    tracing::debug!(backend = backend.name(), path = %path.display(), "Artifact recognised");
                    return Some(model);
                }
                Err(e) => {
                    tracing::debug!(backend = backend.name(), path = %path.display(), error = %e, "Backend declined artifact");
                }
            }
        }
        None
    }

    /// Every backend's rejection message, each terminated by `!`.
    pub fn invalid_message(&self) -> String {
        self.backends
            .iter()
            .map(|b| format!("{}!", b.rejection_message()))
            .collect()
    }
}

impl Default for ModelSelector {
    /// Neural networks first, then classical models.
    fn default() -> Self {
        Self::new(vec![
            Box::new(NeuralNetworkBackend),
            Box::new(ClassicalBackend),
        ])
    }
}

impl std::fmt::Debug for ModelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSelector")
            .field("backends", &self.backend_names())
            .finish()
    }
}

/// Index of the largest value; ties go to the first.
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Check that a batch fits a model input of `expected` values per sample.
pub(crate) fn check_input(batch: &Batch<'_>, expected: usize) -> Result<(), MlError> {
    if batch.sample_len() != expected {
        return Err(MlError::evaluation(format!(
            "model expects {expected} input values per sample, got {}",
            batch.sample_len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Refuses(&'static str);

    impl ModelBackend for Refuses {
        fn name(&self) -> &str {
            self.0
        }

        fn load(&self, _path: &Path) -> Result<Box<dyn LoadedModel>, MlError> {
            Err(MlError::model("never"))
        }

        fn rejection_message(&self) -> String {
            format!("Not a {} model", self.0)
        }
    }

    #[test]
    fn test_invalid_message_aggregates_in_order() {
        let selector = ModelSelector::new(vec![Box::new(Refuses("a")), Box::new(Refuses("b"))]);
        assert_eq!(selector.invalid_message(), "Not a a model!Not a b model!");
    }

    #[test]
    fn test_unrecognised_file_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        assert!(ModelSelector::default().from_file(&path).is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.clf");
        std::fs::write(
            &path,
            r#"{"format": "classical", "n_features_in": 1,
                "estimator": {"kind": "nearest_centroid", "centroids": [[0.0], [1.0]]}}"#,
        )
        .unwrap();
        let selector = ModelSelector::new(vec![
            Box::new(Refuses("first")),
            Box::new(ClassicalBackend),
            Box::new(ClassicalBackend),
        ]);
        let model = selector.from_file(&path).unwrap();
        assert_eq!(model.backend(), "classical");
        assert!(ClassicalBackend.validate(&path));
        assert!(!NeuralNetworkBackend.validate(&path));
    }

    #[test]
    fn test_argmax_ties_go_first() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
        assert_eq!(argmax(&[3.0]), 0);
    }
}
