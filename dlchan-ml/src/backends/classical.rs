//! Classical (non-neural) classifier artifacts (`*.clf`).
//!
//! ```json
//! {
//!   "format": "classical",
//!   "n_features_in": 64,
//!   "classes": [0, 1, 2],
//!   "estimator": { "kind": "linear", "coef": [[...], ...], "intercept": [...] }
//! }
//! ```
//!
//! Supported estimators: `linear` (`coef[classes][features]`, one row for a
//! binary decision), `mlp` (`coefs[layer][in][out]`, `intercepts[layer][out]`)
//! and `nearest_centroid` (`centroids[classes][features]`). Classical models
//! report accuracy only; their loss is always 0.

use super::{BatchScore, LoadedModel, ModelBackend, argmax, check_input};
use crate::dataset::Batch;
use crate::error::MlError;
use dlchan_core::persistence::atomic_write_json;
use serde::{Deserialize, Serialize};
use std::path::Path;

const FORMAT: &str = "classical";
const EXTENSION: &str = ".clf";

fn default_hidden_activation() -> String {
    "relu".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Estimator {
    Linear {
        coef: Vec<Vec<f64>>,
        intercept: Vec<f64>,
    },
    Mlp {
        coefs: Vec<Vec<Vec<f64>>>,
        intercepts: Vec<Vec<f64>>,
        #[serde(default = "default_hidden_activation")]
        activation: String,
    },
    NearestCentroid {
        centroids: Vec<Vec<f64>>,
    },
}

/// On-disk form of a classical classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassicalArtifact {
    pub format: String,
    pub n_features_in: usize,
    /// Class id of each decision output; `0..outputs` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<usize>>,
    pub estimator: Estimator,
}

impl ClassicalArtifact {
    pub fn new(n_features_in: usize, classes: Option<Vec<usize>>, estimator: Estimator) -> Self {
        Self {
            format: FORMAT.to_string(),
            n_features_in,
            classes,
            estimator,
        }
    }

    /// Number of distinct classes the estimator decides between.
    fn decision_classes(&self) -> usize {
        match &self.estimator {
            Estimator::Linear { coef, .. } if coef.len() == 1 => 2,
            Estimator::Linear { coef, .. } => coef.len(),
            Estimator::Mlp { intercepts, .. } => match intercepts.last().map_or(0, Vec::len) {
                1 => 2,
                n => n,
            },
            Estimator::NearestCentroid { centroids } => centroids.len(),
        }
    }

    fn check(&self) -> Result<(), MlError> {
        if self.format != FORMAT {
            return Err(MlError::model(format!("format is {:?}, not {FORMAT:?}", self.format)));
        }
        if self.n_features_in == 0 {
            return Err(MlError::model("n_features_in must be positive"));
        }
        let n = self.n_features_in;
        match &self.estimator {
            Estimator::Linear { coef, intercept } => {
                if coef.is_empty() || coef.len() != intercept.len() {
                    return Err(MlError::model("coef rows must match intercept"));
                }
                if coef.iter().any(|r| r.len() != n) {
                    return Err(MlError::model("coef columns must match n_features_in"));
                }
            }
            Estimator::Mlp {
                coefs,
                intercepts,
                activation,
            } => {
                if coefs.is_empty() || coefs.len() != intercepts.len() {
                    return Err(MlError::model("coefs must match intercepts"));
                }
                let mut width = n;
                for (i, (w, b)) in coefs.iter().zip(intercepts).enumerate() {
                    if w.len() != width || b.is_empty() || w.iter().any(|r| r.len() != b.len()) {
                        return Err(MlError::model(format!("mlp layer {i} has inconsistent shape")));
                    }
                    width = b.len();
                }
                if !matches!(activation.as_str(), "relu" | "tanh" | "logistic" | "identity") {
                    return Err(MlError::model(format!("unknown mlp activation {activation:?}")));
                }
            }
            Estimator::NearestCentroid { centroids } => {
                if centroids.is_empty() || centroids.iter().any(|c| c.len() != n) {
                    return Err(MlError::model("centroids must match n_features_in"));
                }
            }
        }
        if let Some(classes) = &self.classes {
            if classes.len() != self.decision_classes() {
                return Err(MlError::model(format!(
                    "{} class ids for {} decision outputs",
                    classes.len(),
                    self.decision_classes()
                )));
            }
        }
        Ok(())
    }

    /// Decision index (position in `classes`) for one sample.
    fn decide(&self, x: &[f64]) -> usize {
        match &self.estimator {
            Estimator::Linear { coef, intercept } => {
                let scores: Vec<f64> = coef
                    .iter()
                    .zip(intercept)
                    .map(|(row, b)| dot(row, x) + b)
                    .collect();
                binary_or_argmax(&scores)
            }
            Estimator::Mlp {
                coefs,
                intercepts,
                activation,
            } => {
                let mut values = x.to_vec();
                let last = coefs.len() - 1;
                for (i, (w, b)) in coefs.iter().zip(intercepts).enumerate() {
                    let mut out = b.clone();
                    for (xi, row) in values.iter().zip(w) {
                        for (o, wij) in out.iter_mut().zip(row) {
                            *o += xi * wij;
                        }
                    }
                    if i < last {
                        hidden_activation(activation, &mut out);
                    }
                    values = out;
                }
                binary_or_argmax(&values)
            }
            Estimator::NearestCentroid { centroids } => {
                let negative_distances: Vec<f64> = centroids
                    .iter()
                    .map(|c| -c.iter().zip(x).map(|(a, b)| (a - b).powi(2)).sum::<f64>())
                    .collect();
                argmax(&negative_distances)
            }
        }
    }

    fn class_id(&self, decision: usize) -> usize {
        self.classes
            .as_ref()
            .and_then(|c| c.get(decision).copied())
            .unwrap_or(decision)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// A single score is a binary decision function; otherwise the best output wins.
fn binary_or_argmax(scores: &[f64]) -> usize {
    if scores.len() == 1 {
        usize::from(scores[0] > 0.0)
    } else {
        argmax(scores)
    }
}

fn hidden_activation(name: &str, values: &mut [f64]) {
    for v in values.iter_mut() {
        *v = match name {
            "relu" => v.max(0.0),
            "tanh" => v.tanh(),
            "logistic" => 1.0 / (1.0 + (-*v).exp()),
            _ => *v,
        };
    }
}

/// Backend for `*.clf` classical classifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicalBackend;

impl ModelBackend for ClassicalBackend {
    fn name(&self) -> &str {
        "classical"
    }

    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>, MlError> {
        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(EXTENSION));
        if !is_ours {
            return Err(MlError::model(format!("file name does not end in {EXTENSION}")));
        }
        let text = std::fs::read_to_string(path)?;
        let artifact: ClassicalArtifact = serde_json::from_str(&text)?;
        Ok(Box::new(ClassicalModel::new(artifact)?))
    }

    fn rejection_message(&self) -> String {
        format!("Invalid classical model file, must be a {FORMAT} model saved as *{EXTENSION}")
    }
}

/// A loaded classical classifier.
#[derive(Debug, Clone)]
pub struct ClassicalModel {
    artifact: ClassicalArtifact,
    geometry: [usize; 1],
}

impl ClassicalModel {
    pub fn new(artifact: ClassicalArtifact) -> Result<Self, MlError> {
        artifact.check()?;
        let geometry = [artifact.n_features_in];
        Ok(Self { artifact, geometry })
    }
}

impl LoadedModel for ClassicalModel {
    fn backend(&self) -> &str {
        "classical"
    }

    fn input_geometry(&self) -> &[usize] {
        &self.geometry
    }

    fn dimensionality(&self) -> usize {
        1
    }

    fn param_count(&self) -> Option<u64> {
        let count = |w: &Vec<Vec<f64>>, b: &Vec<f64>| {
            (w.len() * w.first().map_or(0, Vec::len) + b.len()) as u64
        };
        match &self.artifact.estimator {
            Estimator::Linear { coef, intercept } => Some(count(coef, intercept)),
            Estimator::Mlp {
                coefs, intercepts, ..
            } => Some(coefs.iter().zip(intercepts).map(|(w, b)| count(w, b)).sum()),
            Estimator::NearestCentroid { .. } => None,
        }
    }

    fn evaluate_batch(&self, batch: &Batch<'_>) -> Result<BatchScore, MlError> {
        check_input(batch, self.artifact.n_features_in)?;
        if batch.is_empty() {
            return Err(MlError::evaluation("empty batch"));
        }
        let correct = (0..batch.len())
            .filter(|&i| self.artifact.class_id(self.artifact.decide(batch.sample(i))) == batch.class_of(i))
            .count();
        Ok(BatchScore {
            accuracy: correct as f64 / batch.len() as f64,
            loss: 0.0,
        })
    }

    fn save(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, &self.artifact)?;
        Ok(())
    }

    fn describe(&self) -> String {
        let kind = match &self.artifact.estimator {
            Estimator::Linear { .. } => "linear",
            Estimator::Mlp { .. } => "multi-layer perceptron",
            Estimator::NearestCentroid { .. } => "nearest centroid",
        };
        let params = self
            .param_count()
            .map_or_else(|| "unknown".to_string(), |p| p.to_string());
        format!(
            "classical {kind}, {} features, {} classes, {params} parameters",
            self.artifact.n_features_in,
            self.artifact.decision_classes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;

    fn data() -> Dataset {
        // Class = index of the largest feature.
        Dataset::from_rows(
            vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0], vec![0.0, 2.0, 1.0]],
            vec![
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.0, 0.0, 1.0],
                vec![0.0, 0.0, 1.0],
            ],
        )
        .unwrap()
    }

    fn identity_linear() -> ClassicalModel {
        ClassicalModel::new(ClassicalArtifact::new(
            3,
            None,
            Estimator::Linear {
                coef: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
                intercept: vec![0.0, 0.0, 0.0],
            },
        ))
        .unwrap()
    }

    #[test]
    fn test_linear_scores_accuracy_with_zero_loss() {
        let score = identity_linear().evaluate_batch(&data().view()).unwrap();
        assert_eq!(score.accuracy, 0.75);
        assert_eq!(score.loss, 0.0);
        assert_eq!(identity_linear().param_count(), Some(12));
    }

    #[test]
    fn test_binary_linear_uses_decision_sign() {
        let model = ClassicalModel::new(ClassicalArtifact::new(
            1,
            Some(vec![3, 7]),
            Estimator::Linear {
                coef: vec![vec![1.0]],
                intercept: vec![-0.5],
            },
        ))
        .unwrap();
        let ds = Dataset::from_rows(vec![vec![0.0], vec![1.0]], vec![vec![3.0], vec![7.0]]).unwrap();
        assert_eq!(model.evaluate_batch(&ds.view()).unwrap().accuracy, 1.0);
    }

    #[test]
    fn test_mlp_param_count() {
        let model = ClassicalModel::new(ClassicalArtifact::new(
            3,
            None,
            Estimator::Mlp {
                coefs: vec![vec![vec![1.0, 0.0]; 3], vec![vec![1.0, 0.0, 0.0]; 2]],
                intercepts: vec![vec![0.0; 2], vec![0.0; 3]],
                activation: "relu".into(),
            },
        ))
        .unwrap();
        assert_eq!(model.param_count(), Some(3 * 2 + 2 + 2 * 3 + 3));
        assert!(model.evaluate_batch(&data().view()).is_ok());
    }

    #[test]
    fn test_nearest_centroid_has_unknown_params() {
        let model = ClassicalModel::new(ClassicalArtifact::new(
            3,
            None,
            Estimator::NearestCentroid {
                centroids: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
            },
        ))
        .unwrap();
        assert_eq!(model.param_count(), None);
        assert_eq!(model.evaluate_batch(&data().view()).unwrap().accuracy, 0.75);
        assert!(model.describe().contains("unknown parameters"));
    }

    #[test]
    fn test_inconsistent_artifacts_rejected() {
        let bad = ClassicalArtifact::new(
            2,
            None,
            Estimator::Linear {
                coef: vec![vec![1.0, 0.0, 0.0]],
                intercept: vec![0.0],
            },
        );
        assert!(ClassicalModel::new(bad).is_err());

        let wrong_classes = ClassicalArtifact::new(
            1,
            Some(vec![0, 1, 2]),
            Estimator::Linear {
                coef: vec![vec![1.0]],
                intercept: vec![0.0],
            },
        );
        assert!(ClassicalModel::new(wrong_classes).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eye.clf");
        identity_linear().save(&path).unwrap();
        let loaded = ClassicalBackend.load(&path).unwrap();
        assert_eq!(loaded.input_geometry(), &[3]);
        assert_eq!(loaded.dimensionality(), 1);
        assert_eq!(loaded.backend(), "classical");
    }
}
