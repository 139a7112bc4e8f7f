//! Dense neural network artifacts (`*.nn`).
//!
//! ```json
//! {
//!   "format": "dense-network",
//!   "input_shape": [64],
//!   "layers": [
//!     { "weights": [[...], ...], "bias": [...], "activation": "relu" },
//!     { "weights": [[...], ...], "bias": [...], "activation": "softmax" }
//!   ]
//! }
//! ```
//!
//! `weights` is `[inputs][outputs]`. A three-dimensional `input_shape`
//! (`[points, channels, maps]`) marks a 2-D model; inputs are flattened
//! row-major before the first layer.

use super::{BatchScore, LoadedModel, ModelBackend, argmax, check_input};
use crate::dataset::Batch;
use crate::error::MlError;
use dlchan_core::persistence::atomic_write_json;
use serde::{Deserialize, Serialize};
use std::path::Path;

const FORMAT: &str = "dense-network";
const EXTENSION: &str = ".nn";

/// Probability floor for the cross-entropy loss.
const EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Linear,
    Softmax,
}

impl Activation {
    fn apply(self, values: &mut [f64]) {
        match self {
            Self::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Self::Sigmoid => values.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
            Self::Tanh => values.iter_mut().for_each(|v| *v = v.tanh()),
            Self::Linear => {}
            Self::Softmax => softmax(values),
        }
    }
}

fn softmax(values: &mut [f64]) {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        values.iter_mut().for_each(|v| *v /= sum);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub activation: Activation,
}

impl DenseLayer {
    fn inputs(&self) -> usize {
        self.weights.len()
    }

    fn outputs(&self) -> usize {
        self.bias.len()
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        let mut out = self.bias.clone();
        for (x, row) in input.iter().zip(&self.weights) {
            for (o, w) in out.iter_mut().zip(row) {
                *o += x * w;
            }
        }
        self.activation.apply(&mut out);
        out
    }
}

/// On-disk form of a dense network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseNetwork {
    pub format: String,
    pub input_shape: Vec<usize>,
    pub layers: Vec<DenseLayer>,
}

impl DenseNetwork {
    pub fn new(input_shape: Vec<usize>, layers: Vec<DenseLayer>) -> Self {
        Self {
            format: FORMAT.to_string(),
            input_shape,
            layers,
        }
    }

    fn check(&self) -> Result<(), MlError> {
        if self.format != FORMAT {
            return Err(MlError::model(format!("format is {:?}, not {FORMAT:?}", self.format)));
        }
        if self.input_shape.is_empty() || self.input_shape.contains(&0) {
            return Err(MlError::model("input_shape must be non-empty and positive"));
        }
        if self.layers.is_empty() {
            return Err(MlError::model("network has no layers"));
        }
        let mut width: usize = self.input_shape.iter().product();
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.inputs() != width {
                return Err(MlError::model(format!(
                    "layer {i} takes {} inputs, previous output has {width}",
                    layer.inputs()
                )));
            }
            if layer.outputs() == 0 || layer.weights.iter().any(|r| r.len() != layer.outputs()) {
                return Err(MlError::model(format!("layer {i} weights do not match its bias")));
            }
            width = layer.outputs();
        }
        Ok(())
    }

    fn input_len(&self) -> usize {
        self.input_shape.iter().product()
    }

    fn forward(&self, sample: &[f64]) -> Vec<f64> {
        let mut values = sample.to_vec();
        for layer in &self.layers {
            values = layer.forward(&values);
        }
        values
    }

    fn ends_in_softmax(&self) -> bool {
        self.layers
            .last()
            .is_some_and(|l| l.activation == Activation::Softmax)
    }
}

/// Backend for `*.nn` dense networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeuralNetworkBackend;

impl ModelBackend for NeuralNetworkBackend {
    fn name(&self) -> &str {
        "dense-network"
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
        let network: DenseNetwork = serde_json::from_str(&text)?;
        network.check()?;
        Ok(Box::new(NeuralNetworkModel { network }))
    }

    fn rejection_message(&self) -> String {
        format!("Invalid neural network model file, must be a {FORMAT} model saved as *{EXTENSION}")
    }
}

/// A loaded dense network.
#[derive(Debug, Clone)]
pub struct NeuralNetworkModel {
    network: DenseNetwork,
}

impl NeuralNetworkModel {
    pub fn new(network: DenseNetwork) -> Result<Self, MlError> {
        network.check()?;
        Ok(Self { network })
    }
}

impl LoadedModel for NeuralNetworkModel {
    fn backend(&self) -> &str {
        "dense-network"
    }

    fn input_geometry(&self) -> &[usize] {
        &self.network.input_shape
    }

    fn dimensionality(&self) -> usize {
        if self.network.input_shape.len() == 3 { 2 } else { 1 }
    }

    fn param_count(&self) -> Option<u64> {
        Some(
            self.network
                .layers
                .iter()
                .map(|l| (l.inputs() * l.outputs() + l.outputs()) as u64)
                .sum(),
        )
    }

    fn evaluate_batch(&self, batch: &Batch<'_>) -> Result<BatchScore, MlError> {
        check_input(batch, self.network.input_len())?;
        if batch.is_empty() {
            return Err(MlError::evaluation("empty batch"));
        }
        let mut correct = 0usize;
        let mut loss = 0.0;
        for i in 0..batch.len() {
            let mut output = self.network.forward(batch.sample(i));
            let truth = batch.class_of(i);
            if truth >= output.len() {
                return Err(MlError::evaluation(format!(
                    "label class {truth} outside the {} model outputs",
                    output.len()
                )));
            }
            if argmax(&output) == truth {
                correct += 1;
            }
            if !self.network.ends_in_softmax() {
                softmax(&mut output);
            }
            loss -= output[truth].max(EPSILON).ln();
        }
        let n = batch.len() as f64;
        Ok(BatchScore {
            accuracy: correct as f64 / n,
            loss: loss / n,
        })
    }

    fn save(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, &self.network)?;
        Ok(())
    }

    fn describe(&self) -> String {
        let widths: Vec<String> = self
            .network
            .layers
            .iter()
            .map(|l| l.outputs().to_string())
            .collect();
        format!(
            "dense network, input {:?}, layers [{}], {} parameters",
            self.network.input_shape,
            widths.join(", "),
            self.param_count().unwrap_or(0)
        )
    }
}
