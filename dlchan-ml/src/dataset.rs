//! Held-out evaluation set and the reshaping applied before each run.
//!
//! Samples are stored row-major in one flat buffer; `sample_shape` describes
//! a single sample (one dimension for flat features, three once channels have
//! been split and stacked). Labels are either one-hot rows or a single class
//! index per sample.
//!
//! The file is expected to be ordered by class: all samples of the first
//! class, then all of the second, and so on. Per-class reshaping relies on it.

use crate::error::MlError;
use dlchan_core::ShuffleMode;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::borrow::Cow;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawDataset {
    #[serde(rename = "X")]
    features: Vec<Vec<f64>>,
    #[serde(rename = "Y")]
    labels: RawLabels,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLabels {
    OneHot(Vec<Vec<f64>>),
    Index(Vec<f64>),
}

/// Features and labels of a labelled classification set.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Vec<f64>,
    sample_shape: Vec<usize>,
    labels: Vec<f64>,
    label_width: usize,
}

impl Dataset {
    pub fn new(
        features: Vec<f64>,
        sample_shape: Vec<usize>,
        labels: Vec<f64>,
        label_width: usize,
    ) -> Result<Self, MlError> {
        let sample_len: usize = sample_shape.iter().product();
        if sample_shape.is_empty() || sample_len == 0 {
            return Err(MlError::dataset("samples must have at least one value"));
        }
        if label_width == 0 {
            return Err(MlError::dataset("label width must be positive"));
        }
        if features.len() % sample_len != 0 || labels.len() % label_width != 0 {
            return Err(MlError::dataset("buffer length does not match the declared shape"));
        }
        if features.len() / sample_len != labels.len() / label_width {
            return Err(MlError::dataset(format!(
                "{} feature rows but {} label rows",
                features.len() / sample_len,
                labels.len() / label_width
            )));
        }
        Ok(Self {
            features,
            sample_shape,
            labels,
            label_width,
        })
    }

    /// Build from feature rows and one-hot label rows.
    pub fn from_rows(features: Vec<Vec<f64>>, labels: Vec<Vec<f64>>) -> Result<Self, MlError> {
        let cols = features.first().map_or(0, Vec::len);
        let width = labels.first().map_or(0, Vec::len);
        if features.iter().any(|r| r.len() != cols) || labels.iter().any(|r| r.len() != width) {
            return Err(MlError::dataset("rows have different lengths"));
        }
        Self::new(
            features.into_iter().flatten().collect(),
            vec![cols],
            labels.into_iter().flatten().collect(),
            width,
        )
    }

    /// Load a JSON file with an `X` matrix and a `Y` matrix (one-hot rows) or
    /// vector (class indices).
    pub fn from_file(path: &Path) -> Result<Self, MlError> {
        let text = std::fs::read_to_string(path)?;
        let raw: RawDataset = serde_json::from_str(&text)
            .map_err(|e| MlError::dataset(format!("{}: {e}", path.display())))?;
        let dataset = match raw.labels {
            RawLabels::OneHot(rows) => Self::from_rows(raw.features, rows)?,
            RawLabels::Index(classes) => {
                Self::from_rows(raw.features, classes.into_iter().map(|c| vec![c]).collect())?
            }
        };
        tracing::info!(
            path = %path.display(),
            samples = dataset.samples(),
            features = dataset.sample_len(),
            "Evaluation set loaded"
        );
        Ok(dataset)
    }

    pub fn samples(&self) -> usize {
        self.labels.len() / self.label_width
    }

    pub fn is_empty(&self) -> bool {
        self.samples() == 0
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    pub fn sample_len(&self) -> usize {
        self.sample_shape.iter().product()
    }

    pub fn label_width(&self) -> usize {
        self.label_width
    }

    /// Class count implied by one-hot labels, `fallback` for index labels.
    pub fn num_classes(&self, fallback: usize) -> usize {
        if self.label_width > 1 {
            self.label_width
        } else {
            fallback
        }
    }

    pub fn sample(&self, i: usize) -> &[f64] {
        let len = self.sample_len();
        &self.features[i * len..(i + 1) * len]
    }

    pub fn label(&self, i: usize) -> &[f64] {
        &self.labels[i * self.label_width..(i + 1) * self.label_width]
    }

    /// Whole set as one batch.
    pub fn view(&self) -> Batch<'_> {
        Batch {
            features: &self.features,
            labels: &self.labels,
            sample_len: self.sample_len(),
            label_width: self.label_width,
        }
    }

    /// Consecutive batches of `size` samples; the last one may be shorter.
    pub fn batches(&self, size: usize) -> impl Iterator<Item = Batch<'_>> {
        let size = size.max(1);
        let sample_len = self.sample_len();
        let label_width = self.label_width;
        self.features
            .chunks(size * sample_len)
            .zip(self.labels.chunks(size * label_width))
            .map(move |(features, labels)| Batch {
                features,
                labels,
                sample_len,
                label_width,
            })
    }

    /// Number of batches `batches(size)` yields.
    pub fn batch_count(&self, size: usize) -> usize {
        self.samples().div_ceil(size.max(1))
    }

    /// Reorder samples so that sample `i` of the result is `order[i]` of `self`.
    pub fn permuted(&self, order: &[usize]) -> Self {
        let mut features = Vec::with_capacity(self.features.len());
        let mut labels = Vec::with_capacity(self.labels.len());
        for &i in order {
            features.extend_from_slice(self.sample(i));
            labels.extend_from_slice(self.label(i));
        }
        Self {
            features,
            sample_shape: self.sample_shape.clone(),
            labels,
            label_width: self.label_width,
        }
    }

    /// Apply the deployment's shuffle mode. A seeded mode yields the same
    /// order on every call.
    pub fn shuffled(&self, mode: ShuffleMode) -> Cow<'_, Self> {
        let mut order: Vec<usize> = (0..self.samples()).collect();
        match mode {
            ShuffleMode::Disabled => return Cow::Borrowed(self),
            ShuffleMode::Fresh => order.shuffle(&mut rand::thread_rng()),
            ShuffleMode::Seeded(seed) => order.shuffle(&mut StdRng::seed_from_u64(seed)),
        }
        Cow::Owned(self.permuted(&order))
    }

    /// Re-cut every class into samples of `new_points` values per channel.
    ///
    /// Per class and per channel the class block is flattened and its first
    /// `new_class_samples * new_points` values are cut into rows, where
    /// `new_class_samples = class_samples * old_points / new_points`. Channels
    /// are concatenated again per row and every new row of a class takes the
    /// label of the first sample of that class. Trailing samples that do not
    /// fill a class block are dropped.
    pub fn shape_per_class(
        &self,
        classes: usize,
        channels: usize,
        new_points: usize,
    ) -> Result<Self, MlError> {
        if self.sample_shape.len() != 1 {
            return Err(MlError::dataset("only flat samples can be reshaped per class"));
        }
        if classes == 0 || channels == 0 || new_points == 0 {
            return Err(MlError::dataset(format!(
                "cannot reshape into {classes} classes, {channels} channels, {new_points} points"
            )));
        }
        let cols = self.sample_shape[0];
        let old_points = cols / channels;
        let class_samples = self.samples() / classes;
        let new_class_samples = class_samples * old_points / new_points;
        if new_class_samples == 0 {
            return Err(MlError::dataset(format!(
                "{class_samples} samples of {old_points} points per class cannot fill one sample of {new_points} points"
            )));
        }

        let new_cols = channels * new_points;
        let mut features = vec![0.0; classes * new_class_samples * new_cols];
        let mut labels = Vec::with_capacity(classes * new_class_samples * self.label_width);

        for class in 0..classes {
            let first = class * class_samples;
            let out_base = class * new_class_samples;
            for ch in 0..channels {
                let flat = (first..first + class_samples)
                    .flat_map(|s| &self.sample(s)[ch * old_points..(ch + 1) * old_points])
                    .take(new_class_samples * new_points);
                for (k, &value) in flat.enumerate() {
                    let (row, col) = (k / new_points, k % new_points);
                    features[(out_base + row) * new_cols + ch * new_points + col] = value;
                }
            }
            for _ in 0..new_class_samples {
                labels.extend_from_slice(self.label(first));
            }
        }

        Self::new(features, vec![new_cols], labels, self.label_width)
    }

    /// Split the flat channel-major last dimension into `[points, channels,
    /// maps]`. The values themselves are not moved, so `maps` must be a
    /// factor the data already has room for.
    pub fn split_stack_channels(&self, channels: usize, maps: usize) -> Result<Self, MlError> {
        let Some((&last, leading)) = self.sample_shape.split_last() else {
            return Err(MlError::dataset("sample has no dimensions"));
        };
        if channels == 0 || maps == 0 || last % channels != 0 {
            return Err(MlError::dataset(format!(
                "cannot split {last} values into {channels} channels"
            )));
        }
        let mut shape = leading.to_vec();
        shape.extend([last / channels, channels, maps]);
        if shape.iter().product::<usize>() != self.sample_len() {
            return Err(MlError::dataset(format!(
                "cannot view a sample of {} values as {:?}",
                self.sample_len(),
                shape
            )));
        }
        Ok(Self {
            features: self.features.clone(),
            sample_shape: shape,
            labels: self.labels.clone(),
            label_width: self.label_width,
        })
    }
}

/// Borrowed run of consecutive samples.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    features: &'a [f64],
    labels: &'a [f64],
    sample_len: usize,
    label_width: usize,
}

impl<'a> Batch<'a> {
    pub fn len(&self) -> usize {
        self.labels.len() / self.label_width
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn sample_len(&self) -> usize {
        self.sample_len
    }

    pub fn sample(&self, i: usize) -> &'a [f64] {
        &self.features[i * self.sample_len..(i + 1) * self.sample_len]
    }

    pub fn label(&self, i: usize) -> &'a [f64] {
        &self.labels[i * self.label_width..(i + 1) * self.label_width]
    }

    /// True class of sample `i`: the hot index of a one-hot row, or the
    /// stored index itself.
    pub fn class_of(&self, i: usize) -> usize {
        let label = self.label(i);
        if label.len() == 1 {
            return label[0].max(0.0) as usize;
        }
        label
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(idx, _)| idx)
    }
}
