// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array2, ArrayView2};

use crate::cache::FeatureCache;
use crate::sample::Sex;
use crate::{EvalError, EvalResult};

/// Embeddings of one dataset stacked row-wise in source order, with the
/// per-row metadata kept alongside.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMatrix {
    features: Array2<f64>,
    ages: Vec<f64>,
    sexes: Vec<Sex>,
}

impl FeatureMatrix {
    pub fn new(features: Array2<f64>, ages: Vec<f64>, sexes: Vec<Sex>) -> EvalResult<Self> {
        if ages.len() != features.nrows() || sexes.len() != features.nrows() {
            return Err(EvalError::ShapeMismatch {
                label: "feature_metadata",
                expected: vec![features.nrows(), features.nrows()],
                actual: vec![ages.len(), sexes.len()],
            });
        }
        Ok(Self {
            features,
            ages,
            sexes,
        })
    }

    /// Wraps bare features with unknown metadata.
    pub fn from_features(features: Array2<f64>) -> Self {
        let rows = features.nrows();
        Self {
            features,
            ages: vec![f64::NAN; rows],
            sexes: vec![Sex::Unknown; rows],
        }
    }

    /// Reads every record of `cache`, validating that the indices form the
    /// contiguous range `[0, count)`.
    ///
    /// `count` comes from the manifest of a finished run. A cache without a
    /// manifest cannot prove it is complete; the range is then taken as one
    /// past the largest index present and a warning is logged.
    pub fn load(cache: &FeatureCache) -> EvalResult<Self> {
        let indices = cache.indices()?;
        let count = match cache.manifest()? {
            Some(manifest) => {
                if manifest.feature_dim.is_none() && manifest.count > 0 {
                    return Err(EvalError::integrity(
                        cache.root(),
                        "manifest lists records but no feature dimension",
                    ));
                }
                manifest.count
            }
            None => {
                let count = indices.last().map_or(0, |last| last + 1);
                tracing::warn!(
                    cache = %cache.root().display(),
                    count,
                    "no manifest found; completeness of the cache cannot be verified"
                );
                count
            }
        };
        Self::load_range(cache, &indices, count)
    }

    /// Like [`FeatureMatrix::load`], additionally requiring exactly `expected`
    /// records. Use this right after extracting a source of known length.
    pub fn load_expected(cache: &FeatureCache, expected: usize) -> EvalResult<Self> {
        let matrix = Self::load(cache)?;
        if matrix.rows() != expected {
            return Err(EvalError::integrity(
                cache.root(),
                format!("expected {expected} records, found {}", matrix.rows()),
            ));
        }
        Ok(matrix)
    }

    fn load_range(cache: &FeatureCache, indices: &[usize], count: usize) -> EvalResult<Self> {
        if let Some(&stray) = indices.iter().find(|&&index| index >= count) {
            return Err(EvalError::integrity(
                cache.root(),
                format!("record {stray} lies outside the expected range 0..{count}"),
            ));
        }
        if let Some(gap) = (0..count).find(|index| indices.binary_search(index).is_err()) {
            return Err(EvalError::MissingRecord {
                dir: cache.root().to_path_buf(),
                index: gap,
            });
        }
        if count == 0 {
            return Err(EvalError::degenerate(
                "feature_collection",
                format!("cache {} holds no records", cache.root().display()),
            ));
        }

        let mut data = Vec::new();
        let mut ages = Vec::with_capacity(count);
        let mut sexes = Vec::with_capacity(count);
        let mut dim = None;
        for index in 0..count {
            let record = cache.read(index)?;
            match dim {
                Some(dim) if dim != record.feature.len() => {
                    return Err(EvalError::integrity(
                        cache.root(),
                        format!(
                            "record {index} has {} features, earlier records have {dim}",
                            record.feature.len()
                        ),
                    ));
                }
                _ => dim = Some(record.feature.len()),
            }
            data.extend(record.feature.iter().map(|&value| f64::from(value)));
            ages.push(record.age);
            sexes.push(record.sex);
        }
        let dim = dim.unwrap_or(0);
        let features = Array2::from_shape_vec((count, dim), data).map_err(|_| {
            EvalError::integrity(cache.root(), "feature payload does not form a matrix")
        })?;
        tracing::debug!(cache = %cache.root().display(), rows = count, dim, "loaded feature matrix");
        Self::new(features, ages, sexes)
    }

    pub fn rows(&self) -> usize {
        self.features.nrows()
    }

    pub fn dim(&self) -> usize {
        self.features.ncols()
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn ages(&self) -> &[f64] {
        &self.ages
    }

    pub fn sexes(&self) -> &[Sex] {
        &self.sexes
    }

    pub fn into_features(self) -> Array2<f64> {
        self.features
    }
}
