// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Fréchet distance between Gaussian fits of two embedding sets.
//!
//! ```text
//! d = ||mu_r - mu_f||^2 + tr(C_r) + tr(C_f) - 2 tr(sqrtm(C_r C_f))
//! ```
//!
//! `C_r C_f` is not symmetric, so its square-root trace is taken from the
//! similar symmetric matrix `S C_f S` with `S = sqrtm(C_r)`; both steps only
//! need symmetric eigen-decompositions.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::{EvalError, EvalResult};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrechetConfig {
    /// Ridge added to both covariances when either is ill-conditioned.
    pub epsilon: f64,
    /// Largest eigenvalue ratio accepted without regularisation.
    pub condition_limit: f64,
}

impl Default for FrechetConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            condition_limit: 1e12,
        }
    }
}

impl FrechetConfig {
    pub fn validate(&self) -> EvalResult<()> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(EvalError::Configuration(format!(
                "frechet epsilon must be positive and finite, got {}",
                self.epsilon
            )));
        }
        if self.condition_limit.is_nan() || self.condition_limit <= 1.0 {
            return Err(EvalError::Configuration(format!(
                "frechet condition limit must exceed 1, got {}",
                self.condition_limit
            )));
        }
        Ok(())
    }
}

/// Mean and unbiased covariance of a set of embeddings.
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianStatistics {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub samples: usize,
}

impl GaussianStatistics {
    /// Fits `[rows, dim]` features. Needs at least two rows.
    pub fn from_features(features: ArrayView2<'_, f64>) -> EvalResult<Self> {
        let (rows, dim) = features.dim();
        if rows < 2 {
            return Err(EvalError::degenerate(
                "gaussian_statistics",
                format!("covariance needs at least two samples, got {rows}"),
            ));
        }
        if dim == 0 {
            return Err(EvalError::degenerate(
                "gaussian_statistics",
                "features have zero dimensions",
            ));
        }
        if features.iter().any(|value| !value.is_finite()) {
            return Err(EvalError::NonFinite {
                label: "gaussian_statistics",
            });
        }
        let data = DMatrix::from_fn(rows, dim, |row, col| features[[row, col]]);
        let mean = data.row_mean().transpose();
        let centred = DMatrix::from_fn(rows, dim, |row, col| data[(row, col)] - mean[col]);
        let covariance = centred.transpose() * &centred / (rows as f64 - 1.0);
        Ok(Self {
            mean,
            covariance,
            samples: rows,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Spectrum summary of one covariance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CovarianceDiagnostics {
    pub samples: usize,
    pub dim: usize,
    pub min_eigenvalue: f64,
    pub max_eigenvalue: f64,
    /// `max / min`; infinite when the smallest eigenvalue is not positive.
    pub condition_number: f64,
}

impl CovarianceDiagnostics {
    fn measure(stats: &GaussianStatistics) -> Self {
        let eigenvalues = SymmetricEigen::new(stats.covariance.clone()).eigenvalues;
        let min_eigenvalue = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
        let max_eigenvalue = eigenvalues
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let condition_number = if min_eigenvalue > 0.0 {
            max_eigenvalue / min_eigenvalue
        } else {
            f64::INFINITY
        };
        Self {
            samples: stats.samples,
            dim: stats.dim(),
            min_eigenvalue,
            max_eigenvalue,
            condition_number,
        }
    }

    fn problem(&self, limit: f64) -> Option<String> {
        if self.samples < self.dim + 1 {
            Some(format!(
                "{} samples cannot span {} dimensions",
                self.samples, self.dim
            ))
        } else if self.min_eigenvalue <= 0.0 {
            Some(format!(
                "smallest eigenvalue {:e} is not positive",
                self.min_eigenvalue
            ))
        } else if self.condition_number > limit {
            Some(format!(
                "condition number {:e} exceeds {:e}",
                self.condition_number, limit
            ))
        } else {
            None
        }
    }
}

/// Numerical conditioning observed while computing one distance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConditioningReport {
    pub real: CovarianceDiagnostics,
    pub fake: CovarianceDiagnostics,
    /// Ridge added to both covariances, if any.
    pub regularization: Option<f64>,
    pub reasons: Vec<String>,
    /// Negative eigenvalues set to zero inside the matrix square roots.
    pub clipped_eigenvalues: usize,
    /// The raw total was slightly negative and was reported as zero.
    pub clamped_negative: bool,
}

impl ConditioningReport {
    /// True when the result needed any numerical intervention.
    pub fn is_warning(&self) -> bool {
        self.regularization.is_some() || self.clipped_eigenvalues > 0 || self.clamped_negative
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrechetReport {
    pub distance: f64,
    pub conditioning: ConditioningReport,
}

/// Fréchet distance between the Gaussian fits of `real` and `fake`.
///
/// Invariant under row permutations of either input up to rounding.
pub fn frechet_distance(
    real: ArrayView2<'_, f64>,
    fake: ArrayView2<'_, f64>,
    config: &FrechetConfig,
) -> EvalResult<FrechetReport> {
    if real.ncols() != fake.ncols() {
        return Err(EvalError::ShapeMismatch {
            label: "frechet_features",
            expected: vec![real.ncols()],
            actual: vec![fake.ncols()],
        });
    }
    let real = GaussianStatistics::from_features(real)?;
    let fake = GaussianStatistics::from_features(fake)?;
    frechet_from_statistics(&real, &fake, config)
}

pub fn frechet_from_statistics(
    real: &GaussianStatistics,
    fake: &GaussianStatistics,
    config: &FrechetConfig,
) -> EvalResult<FrechetReport> {
    config.validate()?;
    if real.dim() != fake.dim() {
        return Err(EvalError::ShapeMismatch {
            label: "frechet_statistics",
            expected: vec![real.dim()],
            actual: vec![fake.dim()],
        });
    }

    let real_diag = CovarianceDiagnostics::measure(real);
    let fake_diag = CovarianceDiagnostics::measure(fake);
    let reasons: Vec<String> = [("real", &real_diag), ("fake", &fake_diag)]
        .into_iter()
        .filter_map(|(side, diag)| {
            diag.problem(config.condition_limit)
                .map(|reason| format!("{side}: {reason}"))
        })
        .collect();

    let mut cov_r = real.covariance.clone();
    let mut cov_f = fake.covariance.clone();
    let regularization = if reasons.is_empty() {
        None
    } else {
        let ridge = DMatrix::<f64>::identity(real.dim(), real.dim()) * config.epsilon;
        cov_r += &ridge;
        cov_f += &ridge;
        tracing::warn!(
            epsilon = config.epsilon,
            reasons = %reasons.join("; "),
            "numerically ill-conditioned covariance; regularising before the matrix square root"
        );
        Some(config.epsilon)
    };

    let (sqrt_r, clipped_r) = psd_sqrt(&cov_r);
    let product = &sqrt_r * &cov_f * &sqrt_r;
    let product = (&product + product.transpose()) * 0.5;
    let eigenvalues = SymmetricEigen::new(product).eigenvalues;
    let tolerance = eigen_tolerance(&eigenvalues);
    let mut clipped = clipped_r;
    let mut trace_sqrt = 0.0;
    for &value in eigenvalues.iter() {
        if value < 0.0 {
            if value < -tolerance {
                clipped += 1;
            }
            continue;
        }
        trace_sqrt += value.sqrt();
    }

    let mean_term = (&real.mean - &fake.mean).norm_squared();
    let raw = mean_term + cov_r.trace() + cov_f.trace() - 2.0 * trace_sqrt;
    if !raw.is_finite() {
        return Err(EvalError::NonFinite {
            label: "frechet_distance",
        });
    }
    let clamped_negative = raw < 0.0;
    let distance = raw.max(0.0);
    if clamped_negative {
        tracing::warn!(raw, "negative Fréchet distance from rounding clamped to zero");
    }
    if clipped > 0 {
        tracing::warn!(clipped, "negative eigenvalues clipped in matrix square root");
    }

    Ok(FrechetReport {
        distance,
        conditioning: ConditioningReport {
            real: real_diag,
            fake: fake_diag,
            regularization,
            reasons,
            clipped_eigenvalues: clipped,
            clamped_negative,
        },
    })
}

fn eigen_tolerance(eigenvalues: &DVector<f64>) -> f64 {
    let scale = eigenvalues.iter().fold(0.0f64, |acc, value| acc.max(value.abs()));
    scale.max(1.0) * eigenvalues.len() as f64 * f64::EPSILON
}

/// Principal square root of a symmetric positive semi-definite matrix.
/// Returns the number of eigenvalues that were clearly negative and clipped.
fn psd_sqrt(matrix: &DMatrix<f64>) -> (DMatrix<f64>, usize) {
    let eigen = SymmetricEigen::new(matrix.clone());
    let tolerance = eigen_tolerance(&eigen.eigenvalues);
    let mut clipped = 0;
    let roots = eigen.eigenvalues.map(|value| {
        if value < -tolerance {
            clipped += 1;
        }
        value.max(0.0).sqrt()
    });
    let root = &eigen.eigenvectors * DMatrix::from_diagonal(&roots) * eigen.eigenvectors.transpose();
    (root, clipped)
}
