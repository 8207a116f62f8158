// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Samples and the sources that yield them.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::format::{self, StorageFormat};
use crate::{EvalError, EvalResult};

/// Categorical sex metadata carried alongside every sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    #[serde(alias = "f", alias = "F", alias = "Female")]
    Female,
    #[serde(alias = "m", alias = "M", alias = "Male")]
    Male,
    #[default]
    Unknown,
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Female => f.write_str("female"),
            Self::Male => f.write_str("male"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// One image or scan with its scalar metadata.
///
/// The volume is laid out as `[channels, depth, height, width]`. 2D data is
/// represented with a depth of one.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    volume: Array4<f32>,
    pub age: f64,
    pub sex: Sex,
}

impl Sample {
    pub fn new(volume: Array4<f32>, age: f64, sex: Sex) -> EvalResult<Self> {
        if volume.shape().iter().any(|&extent| extent == 0) {
            return Err(EvalError::degenerate(
                "sample_volume",
                format!("volume has an empty axis (shape {:?})", volume.shape()),
            ));
        }
        if !age.is_finite() {
            return Err(EvalError::NonFinite { label: "sample_age" });
        }
        Ok(Self { volume, age, sex })
    }

    /// Volume filled with `value`, mostly useful for synthetic datasets.
    pub fn constant(
        shape: (usize, usize, usize, usize),
        value: f32,
        age: f64,
        sex: Sex,
    ) -> EvalResult<Self> {
        Self::new(Array4::from_elem(shape, value), age, sex)
    }

    pub fn volume(&self) -> ArrayView4<'_, f32> {
        self.volume.view()
    }

    pub fn channels(&self) -> usize {
        self.volume.shape()[0]
    }

    pub fn depth(&self) -> usize {
        self.volume.shape()[1]
    }

    pub fn into_volume(self) -> Array4<f32> {
        self.volume
    }
}

/// Restartable, order-stable sequence of samples.
///
/// Every call to [`SampleSource::samples`] starts a new pass. Implementations
/// must yield the same samples in the same order on every pass: feature
/// caches are resumed by position and the pairwise sampler identifies samples
/// by position.
pub trait SampleSource {
    fn samples(&self) -> Box<dyn Iterator<Item = EvalResult<Sample>> + '_>;

    /// Number of samples in one pass, when known without iterating.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Samples held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    samples: Vec<Sample>,
}

impl InMemorySource {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl FromIterator<Sample> for InMemorySource {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl SampleSource for InMemorySource {
    fn samples(&self) -> Box<dyn Iterator<Item = EvalResult<Sample>> + '_> {
        Box::new(self.samples.iter().cloned().map(Ok))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.samples.len())
    }
}

/// Serialised form of a sample: a shape, a flat row-major buffer and the
/// metadata. A three-dimensional shape is read as a single-channel volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredSample {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub age: f64,
    #[serde(default)]
    pub sex: Sex,
}

impl StoredSample {
    pub fn from_sample(sample: &Sample) -> Self {
        Self {
            shape: sample.volume.shape().to_vec(),
            data: sample.volume.iter().copied().collect(),
            age: sample.age,
            sex: sample.sex,
        }
    }

    pub fn into_sample(self) -> EvalResult<Sample> {
        let dims = match self.shape.as_slice() {
            &[c, d, h, w] => (c, d, h, w),
            &[d, h, w] => (1, d, h, w),
            other => {
                return Err(EvalError::ShapeMismatch {
                    label: "stored_sample_shape",
                    expected: vec![0; 4],
                    actual: other.to_vec(),
                })
            }
        };
        let expected = dims.0 * dims.1 * dims.2 * dims.3;
        if self.data.len() != expected {
            return Err(EvalError::ShapeMismatch {
                label: "stored_sample_data",
                expected: vec![expected],
                actual: vec![self.data.len()],
            });
        }
        let volume = Array4::from_shape_vec(dims, self.data).map_err(|_| {
            EvalError::ShapeMismatch {
                label: "stored_sample_data",
                expected: vec![dims.0, dims.1, dims.2, dims.3],
                actual: vec![expected],
            }
        })?;
        Sample::new(volume, self.age, self.sex)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> EvalResult<()> {
        let path = path.as_ref();
        let format = StorageFormat::from_path(path).unwrap_or_default();
        format::write_value(path, format, self)
    }
}

/// Directory of stored samples, one file per sample.
///
/// The file list is fixed when the source is opened and ordered by file name,
/// which keeps the iteration order stable across passes. Files are decoded
/// lazily, one per step of the iterator.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    root: PathBuf,
    files: Vec<(PathBuf, StorageFormat)>,
}

impl DirectorySource {
    pub fn open(root: impl AsRef<Path>) -> EvalResult<Self> {
        let root = root.as_ref().to_path_buf();
        let entries = fs::read_dir(&root).map_err(|err| EvalError::io(&root, err))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| EvalError::io(&root, err))?;
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(true, |name| name.starts_with('.'));
            if hidden || !path.is_file() {
                continue;
            }
            if let Some(format) = StorageFormat::from_path(&path) {
                files.push((path, format));
            }
        }
        files.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
        tracing::debug!(root = %root.display(), samples = files.len(), "opened sample directory");
        Ok(Self { root, files })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Writes `samples` as `sample_00000.<ext>`, ... so that name order equals
    /// the given order.
    pub fn write_all(
        root: impl AsRef<Path>,
        samples: &[Sample],
        format: StorageFormat,
    ) -> EvalResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|err| EvalError::io(root, err))?;
        for (index, sample) in samples.iter().enumerate() {
            let path = root.join(format!("sample_{index:05}.{}", format.extension()));
            format::write_value(&path, format, &StoredSample::from_sample(sample))?;
        }
        Self::open(root)
    }
}

impl SampleSource for DirectorySource {
    fn samples(&self) -> Box<dyn Iterator<Item = EvalResult<Sample>> + '_> {
        Box::new(self.files.iter().map(|(path, format)| {
            let stored: StoredSample = format::read_value(path, *format)?;
            stored.into_sample()
        }))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.files.len())
    }
}
