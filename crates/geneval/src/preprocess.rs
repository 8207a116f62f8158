// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Modality-specific preprocessing applied before feature extraction.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array3, Array4, ArrayD, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::sample::Sample;
use crate::{EvalError, EvalResult};

/// Per-channel mean of the 2D backbone's training data, in BGR order.
pub const IMAGENET_BGR_MEAN: [f32; 3] = [0.406, 0.456, 0.485];

/// Kind of data under evaluation; selects both preprocessing and backbone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    /// Whole scans fed to a 3D network.
    #[serde(rename = "volumetric")]
    Volumetric,
    /// Central slice of each scan fed to a 2D natural-image network.
    #[serde(rename = "2d-slice")]
    Slice2d,
}

impl Modality {
    /// Spatial rank of the tensors the modality's backbone consumes.
    pub fn spatial_dims(self) -> usize {
        match self {
            Self::Volumetric => 3,
            Self::Slice2d => 2,
        }
    }

    /// Rank of a batch (`[batch, channels, spatial...]`) for this modality.
    pub fn batch_rank(self) -> usize {
        self.spatial_dims() + 2
    }

    pub fn preprocessor(self, rng: StdRng) -> Box<dyn Preprocess> {
        match self {
            Self::Volumetric => Box::new(IntensityNormalizer::new(rng)),
            Self::Slice2d => Box::new(CentralSliceTransform::default()),
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Volumetric => f.write_str("volumetric"),
            Self::Slice2d => f.write_str("2d-slice"),
        }
    }
}

impl FromStr for Modality {
    type Err = EvalError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "volumetric" | "3d" | "medicalnet" => Ok(Self::Volumetric),
            "2d-slice" | "2d" | "slice" | "imagenet" => Ok(Self::Slice2d),
            other => Err(EvalError::Configuration(format!(
                "unknown modality '{other}' (expected 'volumetric' or '2d-slice')"
            ))),
        }
    }
}

/// Turns a raw sample into the tensor layout a backbone expects.
///
/// The output never carries a batch axis; the caller adds it.
pub trait Preprocess {
    fn name(&self) -> &'static str;

    fn transform(&mut self, sample: &Sample) -> EvalResult<ArrayD<f32>>;
}

/// Foreground z-score normalisation for volumetric scans.
///
/// Mean and unbiased standard deviation are taken over voxels strictly greater
/// than zero. The whole volume is shifted and scaled by them, then every voxel
/// that was exactly zero is overwritten with a standard normal draw. Negative
/// voxels are scaled like the foreground.
#[derive(Debug)]
pub struct IntensityNormalizer<R = StdRng> {
    rng: R,
}

impl<R: Rng> IntensityNormalizer<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn normalize(&mut self, volume: ArrayView4<'_, f32>) -> EvalResult<Array4<f32>> {
        let stats = ForegroundStats::measure(volume)?;
        let rng = &mut self.rng;
        let mean = stats.mean;
        let std = stats.std;
        Ok(volume.mapv(|value| {
            if value == 0.0 {
                rng.sample::<f32, _>(StandardNormal)
            } else {
                ((f64::from(value) - mean) / std) as f32
            }
        }))
    }
}

impl<R: Rng> Preprocess for IntensityNormalizer<R> {
    fn name(&self) -> &'static str {
        "foreground-zscore"
    }

    fn transform(&mut self, sample: &Sample) -> EvalResult<ArrayD<f32>> {
        Ok(self.normalize(sample.volume())?.into_dyn())
    }
}

/// Mean and unbiased standard deviation of the strictly positive voxels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForegroundStats {
    pub voxels: usize,
    pub mean: f64,
    pub std: f64,
}

impl ForegroundStats {
    pub fn measure(volume: ArrayView4<'_, f32>) -> EvalResult<Self> {
        let mut voxels = 0usize;
        let mut sum = 0.0f64;
        for &value in volume.iter() {
            if !value.is_finite() {
                return Err(EvalError::NonFinite {
                    label: "volume_intensity",
                });
            }
            if value > 0.0 {
                voxels += 1;
                sum += f64::from(value);
            }
        }
        if voxels == 0 {
            return Err(EvalError::degenerate(
                "foreground_normalisation",
                "volume has no voxel greater than zero",
            ));
        }
        if voxels == 1 {
            return Err(EvalError::degenerate(
                "foreground_normalisation",
                "standard deviation of a single foreground voxel is undefined",
            ));
        }
        let mean = sum / voxels as f64;
        let squares: f64 = volume
            .iter()
            .filter(|&&value| value > 0.0)
            .map(|&value| (f64::from(value) - mean).powi(2))
            .sum();
        let std = (squares / (voxels - 1) as f64).sqrt();
        if std <= 0.0 || !std.is_finite() {
            return Err(EvalError::degenerate(
                "foreground_normalisation",
                format!("foreground is constant ({mean}); standard deviation is zero"),
            ));
        }
        Ok(Self { voxels, mean, std })
    }
}

/// Central depth slice prepared for a 2D network trained on BGR images.
///
/// Takes slice `depth / 2`, replicates a single channel to three, reverses the
/// channel order and subtracts [`IMAGENET_BGR_MEAN`].
#[derive(Clone, Debug)]
pub struct CentralSliceTransform {
    mean: [f32; 3],
}

impl Default for CentralSliceTransform {
    fn default() -> Self {
        Self {
            mean: IMAGENET_BGR_MEAN,
        }
    }
}

impl CentralSliceTransform {
    pub fn with_mean(mean: [f32; 3]) -> Self {
        Self { mean }
    }

    pub fn apply(&self, volume: ArrayView4<'_, f32>) -> EvalResult<Array3<f32>> {
        let depth = volume.len_of(Axis(1));
        let slice = volume.index_axis(Axis(1), depth / 2);
        let channels = slice.len_of(Axis(0));
        if channels != 1 && channels != 3 {
            return Err(EvalError::ShapeMismatch {
                label: "slice_channels",
                expected: vec![3],
                actual: vec![channels],
            });
        }
        let (height, width) = (slice.len_of(Axis(1)), slice.len_of(Axis(2)));
        let mut out = Array3::<f32>::zeros((3, height, width));
        for (target, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
            // Reversed channel order; a grey image reads channel 0 for all three.
            let source = if channels == 1 { 0 } else { 2 - target };
            let shift = self.mean[target];
            plane.zip_mut_with(&slice.index_axis(Axis(0), source), |dst, &src| {
                *dst = src - shift;
            });
        }
        Ok(out)
    }
}

impl Preprocess for CentralSliceTransform {
    fn name(&self) -> &'static str {
        "central-slice-bgr"
    }

    fn transform(&mut self, sample: &Sample) -> EvalResult<ArrayD<f32>> {
        Ok(self.apply(sample.volume())?.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sex;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use rand::SeedableRng;

    fn ramp_volume() -> Array4<f32> {
        // Half background, half a ramp of positive intensities.
        Array::from_shape_fn((1, 4, 6, 6), |(_, d, h, w)| {
            if d < 2 {
                0.0
            } else {
                1.0 + (h * 6 + w) as f32 * 0.5 + d as f32
            }
        })
    }

    #[test]
    fn modality_names_parse() {
        assert_eq!("volumetric".parse::<Modality>().unwrap(), Modality::Volumetric);
        assert_eq!("2D-Slice".parse::<Modality>().unwrap(), Modality::Slice2d);
        assert!(matches!(
            "pet".parse::<Modality>(),
            Err(EvalError::Configuration(_))
        ));
    }

    #[test]
    fn foreground_is_standardised() {
        let volume = ramp_volume();
        let mut normalizer = IntensityNormalizer::new(StdRng::seed_from_u64(3));
        let out = normalizer.normalize(volume.view()).unwrap();
        let foreground: Vec<f64> = volume
            .iter()
            .zip(out.iter())
            .filter(|(raw, _)| **raw > 0.0)
            .map(|(_, norm)| f64::from(*norm))
            .collect();
        let n = foreground.len() as f64;
        let mean = foreground.iter().sum::<f64>() / n;
        let var = foreground.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn background_is_replaced_by_noise() {
        let volume = ramp_volume();
        let mut normalizer = IntensityNormalizer::new(StdRng::seed_from_u64(11));
        let out = normalizer.normalize(volume.view()).unwrap();
        let background: Vec<f32> = volume
            .iter()
            .zip(out.iter())
            .filter(|(raw, _)| **raw == 0.0)
            .map(|(_, norm)| *norm)
            .collect();
        let stats = ForegroundStats::measure(volume.view()).unwrap();
        let constant = (-stats.mean / stats.std) as f32;
        assert_eq!(background.len(), 72);
        assert!(background.iter().any(|v| (v - constant).abs() > 1e-3));
        let distinct = background
            .windows(2)
            .filter(|pair| pair[0] != pair[1])
            .count();
        assert!(distinct > 60);
    }

    #[test]
    fn same_seed_reproduces_background() {
        let volume = ramp_volume();
        let a = IntensityNormalizer::new(StdRng::seed_from_u64(5))
            .normalize(volume.view())
            .unwrap();
        let b = IntensityNormalizer::new(StdRng::seed_from_u64(5))
            .normalize(volume.view())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_positive_volume_is_degenerate() {
        let volume = Array4::from_shape_fn((1, 2, 3, 3), |(_, d, _, _)| -(d as f32));
        let mut normalizer = IntensityNormalizer::new(StdRng::seed_from_u64(0));
        let err = normalizer.normalize(volume.view()).unwrap_err();
        assert!(matches!(err, EvalError::DegenerateInput { .. }));
    }

    #[test]
    fn constant_foreground_is_degenerate() {
        let sample = Sample::constant((1, 3, 3, 3), 1.0, 60.0, Sex::Female).unwrap();
        let mut normalizer = IntensityNormalizer::new(StdRng::seed_from_u64(0));
        assert!(matches!(
            normalizer.transform(&sample),
            Err(EvalError::DegenerateInput { .. })
        ));
    }

    #[test]
    fn nan_voxel_fails_loudly() {
        let mut volume = ramp_volume();
        volume[[0, 3, 0, 0]] = f32::NAN;
        let mut normalizer = IntensityNormalizer::new(StdRng::seed_from_u64(0));
        assert!(matches!(
            normalizer.normalize(volume.view()),
            Err(EvalError::NonFinite { .. })
        ));
    }

    #[test]
    fn central_slice_uses_integer_midpoint() {
        // depth 5 -> slice 2; each slice filled with its depth index.
        let volume = Array4::from_shape_fn((1, 5, 2, 2), |(_, d, _, _)| d as f32);
        let out = CentralSliceTransform::with_mean([0.0; 3])
            .apply(volume.view())
            .unwrap();
        assert_eq!(out.shape(), &[3, 2, 2]);
        assert!(out.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn grey_slice_is_replicated_then_mean_shifted() {
        let volume = Array4::from_elem((1, 4, 2, 3), 1.0f32);
        let out = CentralSliceTransform::default().apply(volume.view()).unwrap();
        for (channel, mean) in IMAGENET_BGR_MEAN.iter().enumerate() {
            for &value in out.index_axis(Axis(0), channel).iter() {
                assert_abs_diff_eq!(value, 1.0 - mean, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn colour_channels_are_reversed() {
        let volume = Array4::from_shape_fn((3, 1, 1, 1), |(c, _, _, _)| (c + 1) as f32 * 10.0);
        let out = CentralSliceTransform::default().apply(volume.view()).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0]], 30.0 - 0.406, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[1, 0, 0]], 20.0 - 0.456, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[2, 0, 0]], 10.0 - 0.485, epsilon = 1e-5);
    }

    #[test]
    fn two_channel_slice_is_rejected() {
        let volume = Array4::<f32>::ones((2, 3, 2, 2));
        assert!(matches!(
            CentralSliceTransform::default().apply(volume.view()),
            Err(EvalError::ShapeMismatch { .. })
        ));
    }
}
