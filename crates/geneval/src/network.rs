// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reference feature network and checkpoint-backed backbone construction.

use std::path::Path;

use ndarray::{Array1, Array2, Array3, ArrayD, ArrayViewD, Axis, Ix1, Ix2, IxDyn};

use crate::backbone::{Backbone, FeatureNetwork, SliceBackbone, VolumetricBackbone};
use crate::checkpoint::Checkpoint;
use crate::ops;
use crate::preprocess::Modality;
use crate::{EvalError, EvalResult};

const WEIGHT: &str = "embed.weight";
const BIAS: &str = "embed.bias";
const PATCH: &str = "embed.patch";

/// Patch embedding: mean pooling over non-overlapping patches followed by a
/// shared linear projection and ReLU.
///
/// Maps `[batch, in, s_1..s_k]` to `[batch, out, s_1/p..s_k/p]`, i.e. a strided
/// convolution whose kernel is constant over each patch. It accepts any
/// spatial rank, so the same weights format serves both backbones.
#[derive(Clone, Debug)]
pub struct PatchEmbedding {
    patch: usize,
    spatial_dims: usize,
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl PatchEmbedding {
    pub fn new(
        patch: usize,
        spatial_dims: usize,
        weight: Array2<f32>,
        bias: Array1<f32>,
    ) -> EvalResult<Self> {
        if patch == 0 {
            return Err(EvalError::Configuration(
                "patch size must be greater than zero".to_string(),
            ));
        }
        if weight.nrows() != bias.len() || weight.is_empty() {
            return Err(EvalError::ShapeMismatch {
                label: "patch_embedding_bias",
                expected: vec![weight.nrows()],
                actual: vec![bias.len()],
            });
        }
        Ok(Self {
            patch,
            spatial_dims,
            weight,
            bias,
        })
    }

    /// Builds the network from `embed.weight [out, in]`, `embed.bias [out]`
    /// and `embed.patch [1]`, rejecting any other parameter.
    pub fn from_checkpoint(mut checkpoint: Checkpoint, spatial_dims: usize) -> EvalResult<Self> {
        let origin = checkpoint.origin().to_path_buf();
        let invalid = |reason: String| EvalError::Checkpoint {
            path: origin.clone(),
            reason,
        };
        let weight = checkpoint
            .take(WEIGHT, 2)?
            .into_dimensionality::<Ix2>()
            .map_err(|err| invalid(err.to_string()))?;
        let bias = checkpoint
            .take(BIAS, 1)?
            .into_dimensionality::<Ix1>()
            .map_err(|err| invalid(err.to_string()))?;
        let patch = checkpoint.take(PATCH, 1)?;
        let patch = match patch.as_slice() {
            Some(&[value]) if value >= 1.0 && value.fract() == 0.0 => value as usize,
            _ => return Err(invalid(format!("'{PATCH}' must hold one positive integer"))),
        };
        checkpoint.finish()?;
        Self::new(patch, spatial_dims, weight, bias).map_err(|err| invalid(err.to_string()))
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert(WEIGHT, &self.weight.clone().into_dyn());
        checkpoint.insert(BIAS, &self.bias.clone().into_dyn());
        checkpoint.insert(
            PATCH,
            &ArrayD::from_elem(IxDyn(&[1]), self.patch as f32),
        );
        checkpoint
    }

    pub fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }
}

impl FeatureNetwork for PatchEmbedding {
    fn forward(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<ArrayD<f32>> {
        let shape = batch.shape();
        if shape.len() != self.spatial_dims + 2 || shape[1] != self.in_channels() {
            return Err(EvalError::ShapeMismatch {
                label: "patch_embedding_input",
                expected: vec![self.in_channels()],
                actual: shape.to_vec(),
            });
        }
        if shape[2..].iter().any(|&extent| extent < self.patch) {
            return Err(EvalError::ShapeMismatch {
                label: "patch_embedding_spatial",
                expected: vec![self.patch; self.spatial_dims],
                actual: shape[2..].to_vec(),
            });
        }
        let pooled = ops::avg_pool(batch.mapv(f64::from).view(), self.patch, 2);
        let pooled_shape = pooled.shape().to_vec();
        let (size, channels) = (pooled_shape[0], pooled_shape[1]);
        let positions: usize = pooled_shape[2..].iter().product();
        let tokens = pooled
            .mapv(|value| value as f32)
            .into_shape((size, channels, positions))
            .map_err(|_| EvalError::ShapeMismatch {
                label: "patch_embedding_tokens",
                expected: vec![size, channels, positions],
                actual: pooled_shape.clone(),
            })?;

        let mut out = Array3::<f32>::zeros((size, self.out_channels(), positions));
        for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(tokens.axis_iter(Axis(0))) {
            let projected = self.weight.dot(&src);
            dst.assign(&projected);
            for (mut row, &bias) in dst.axis_iter_mut(Axis(0)).zip(self.bias.iter()) {
                row.mapv_inplace(|value| (value + bias).max(0.0));
            }
        }

        let mut out_shape = vec![size, self.out_channels()];
        out_shape.extend_from_slice(&pooled_shape[2..]);
        out.into_shape(IxDyn(&out_shape))
            .map_err(|_| EvalError::ShapeMismatch {
                label: "patch_embedding_output",
                expected: out_shape.clone(),
                actual: vec![size, self.out_channels(), positions],
            })
    }
}

/// Loads the weights at `path` and wraps them in the adapter for `modality`.
pub fn load_backbone(modality: Modality, path: &Path) -> EvalResult<Box<dyn Backbone>> {
    let checkpoint = Checkpoint::load(path)?;
    let network = PatchEmbedding::from_checkpoint(checkpoint, modality.spatial_dims())?;
    let name = format!(
        "patch-embed-{}x{}",
        network.in_channels(),
        network.out_channels()
    );
    tracing::info!(%modality, backbone = %name, weights = %path.display(), "loaded backbone");
    let backbone: Box<dyn Backbone> = match modality {
        Modality::Volumetric => Box::new(VolumetricBackbone::new(name, network)),
        Modality::Slice2d => Box::new(SliceBackbone::new(name, network)),
    };
    Ok(backbone)
}
