// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Multi-scale structural similarity over `[channels, spatial...]` arrays.

use ndarray::{ArrayD, ArrayViewD, Zip};
use serde::{Deserialize, Serialize};

use crate::ops;
use crate::{EvalError, EvalResult};

const CHANNEL_AXES: usize = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsSsimConfig {
    pub kernel_size: usize,
    pub kernel_sigma: f64,
    pub data_range: f64,
    pub k1: f64,
    pub k2: f64,
    /// One exponent per scale, finest first.
    pub weights: Vec<f64>,
}

impl Default for MsSsimConfig {
    fn default() -> Self {
        Self {
            kernel_size: 9,
            kernel_sigma: 1.5,
            data_range: 1.0,
            k1: 0.01,
            k2: 0.03,
            weights: vec![0.0448, 0.2856, 0.3001, 0.2363, 0.1333],
        }
    }
}

impl MsSsimConfig {
    pub fn validate(&self) -> EvalResult<()> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(EvalError::Configuration(format!(
                "ms-ssim kernel size must be odd and positive, got {}",
                self.kernel_size
            )));
        }
        if !(self.kernel_sigma > 0.0 && self.data_range > 0.0) {
            return Err(EvalError::Configuration(
                "ms-ssim sigma and data range must be positive".to_string(),
            ));
        }
        if self.weights.is_empty() || self.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EvalError::Configuration(
                "ms-ssim needs at least one non-negative scale weight".to_string(),
            ));
        }
        Ok(())
    }

    /// Every spatial extent must exceed this for the coarsest scale to still
    /// fit one filter window. Saturates at `usize::MAX` for scale counts no
    /// volume can satisfy.
    pub fn min_extent(&self) -> usize {
        let halvings = self.weights.len().saturating_sub(1);
        u32::try_from(halvings)
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift))
            .and_then(|factor| self.kernel_size.saturating_sub(1).checked_mul(factor))
            .unwrap_or(usize::MAX)
    }
}

struct ScaleTerms {
    ssim: f64,
    contrast: f64,
}

fn scale_terms(x: &ArrayD<f64>, y: &ArrayD<f64>, kernel: &[f64], config: &MsSsimConfig) -> ScaleTerms {
    let c1 = (config.k1 * config.data_range).powi(2);
    let c2 = (config.k2 * config.data_range).powi(2);
    let blur = |input: &ArrayD<f64>| ops::separable_filter(input.view(), kernel, CHANNEL_AXES);

    let mu_x = blur(x);
    let mu_y = blur(y);
    let mu_xx = blur(&(x * x));
    let mu_yy = blur(&(y * y));
    let mu_xy = blur(&(x * y));

    let mut ssim_sum = 0.0;
    let mut contrast_sum = 0.0;
    Zip::from(&mu_x)
        .and(&mu_y)
        .and(&mu_xx)
        .and(&mu_yy)
        .and(&mu_xy)
        .for_each(|&mx, &my, &mxx, &myy, &mxy| {
            let sigma_x = mxx - mx * mx;
            let sigma_y = myy - my * my;
            let sigma_xy = mxy - mx * my;
            let contrast = (2.0 * sigma_xy + c2) / (sigma_x + sigma_y + c2);
            let luminance = (2.0 * mx * my + c1) / (mx * mx + my * my + c1);
            contrast_sum += contrast;
            ssim_sum += luminance * contrast;
        });
    let count = mu_x.len() as f64;
    ScaleTerms {
        ssim: ssim_sum / count,
        contrast: contrast_sum / count,
    }
}

/// MS-SSIM of two equally shaped arrays whose first axis holds channels.
///
/// Every scale but the coarsest contributes its mean contrast-sensitivity term;
/// the coarsest contributes its mean SSIM. Each term is clipped at zero and
/// raised to its scale weight before the product is taken.
pub fn ms_ssim(
    a: ArrayViewD<'_, f32>,
    b: ArrayViewD<'_, f32>,
    config: &MsSsimConfig,
) -> EvalResult<f64> {
    config.validate()?;
    if a.shape() != b.shape() {
        return Err(EvalError::ShapeMismatch {
            label: "ms_ssim",
            expected: a.shape().to_vec(),
            actual: b.shape().to_vec(),
        });
    }
    if a.ndim() < CHANNEL_AXES + 1 {
        return Err(EvalError::ShapeMismatch {
            label: "ms_ssim_rank",
            expected: vec![CHANNEL_AXES + 1],
            actual: a.shape().to_vec(),
        });
    }
    let smallest = a.shape()[CHANNEL_AXES..].iter().copied().min().unwrap_or(0);
    if smallest <= config.min_extent() {
        return Err(EvalError::degenerate(
            "ms_ssim",
            format!(
                "spatial size {smallest} must exceed {} for {} scales with a {}-tap window",
                config.min_extent(),
                config.weights.len(),
                config.kernel_size
            ),
        ));
    }
    if a.iter().chain(b.iter()).any(|value| !value.is_finite()) {
        return Err(EvalError::NonFinite { label: "ms_ssim" });
    }

    let kernel = ops::gaussian_kernel(config.kernel_size, config.kernel_sigma);
    let mut x = a.mapv(f64::from);
    let mut y = b.mapv(f64::from);
    let last = config.weights.len() - 1;
    let mut result = 1.0;
    for (scale, weight) in config.weights.iter().enumerate() {
        let terms = scale_terms(&x, &y, &kernel, config);
        let value = if scale == last {
            terms.ssim
        } else {
            terms.contrast
        };
        result *= value.max(0.0).powf(*weight);
        if scale < last {
            x = ops::avg_pool(x.view(), 2, CHANNEL_AXES);
            y = ops::avg_pool(y.view(), 2, CHANNEL_AXES);
        }
    }
    if !result.is_finite() {
        return Err(EvalError::NonFinite { label: "ms_ssim" });
    }
    Ok(result)
}
