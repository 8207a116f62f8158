// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Uniform `batch → embedding` adapters over pretrained feature networks.

use ndarray::{Array2, ArrayD, ArrayViewD, Axis};

use crate::preprocess::Modality;
use crate::{EvalError, EvalResult};

/// A pretrained network treated as a black box.
///
/// Implementations are inference-only and must be deterministic for fixed
/// weights and input.
pub trait FeatureNetwork {
    fn forward(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<ArrayD<f32>>;
}

impl<N: FeatureNetwork + ?Sized> FeatureNetwork for Box<N> {
    fn forward(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<ArrayD<f32>> {
        (**self).forward(batch)
    }
}

impl<N: FeatureNetwork + ?Sized> FeatureNetwork for &N {
    fn forward(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<ArrayD<f32>> {
        (**self).forward(batch)
    }
}

/// Produces one embedding row per batch element.
pub trait Backbone {
    fn name(&self) -> &str;

    /// Modality whose preprocessed tensors this backbone accepts.
    fn modality(&self) -> Modality;

    /// Embeddings of shape `[batch, features]`.
    fn extract(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<Array2<f32>>;
}

fn check_batch_rank(batch: &ArrayViewD<'_, f32>, modality: Modality) -> EvalResult<usize> {
    if batch.ndim() != modality.batch_rank() || batch.is_empty() {
        return Err(EvalError::ShapeMismatch {
            label: "backbone_batch",
            expected: vec![modality.batch_rank()],
            actual: batch.shape().to_vec(),
        });
    }
    Ok(batch.len_of(Axis(0)))
}

fn check_output(output: &ArrayD<f32>, batch: usize) -> EvalResult<()> {
    if output.ndim() < 2 || output.len_of(Axis(0)) != batch {
        return Err(EvalError::ShapeMismatch {
            label: "network_output",
            expected: vec![batch],
            actual: output.shape().to_vec(),
        });
    }
    Ok(())
}

fn ensure_finite(embedding: Array2<f32>) -> EvalResult<Array2<f32>> {
    if embedding.iter().all(|value| value.is_finite()) {
        Ok(embedding)
    } else {
        Err(EvalError::NonFinite {
            label: "backbone_embedding",
        })
    }
}

/// Averages `[batch, channels, spatial...]` over every spatial axis.
pub fn global_average_pool(features: ArrayD<f32>) -> EvalResult<Array2<f32>> {
    let shape = features.shape().to_vec();
    if shape.len() < 2 {
        return Err(EvalError::ShapeMismatch {
            label: "global_average_pool",
            expected: vec![0, 0],
            actual: shape,
        });
    }
    let (batch, channels) = (shape[0], shape[1]);
    let spatial: usize = shape[2..].iter().product();
    if spatial == 0 {
        return Err(EvalError::ShapeMismatch {
            label: "global_average_pool",
            expected: vec![batch, channels, 1],
            actual: shape,
        });
    }
    let grouped = features
        .as_standard_layout()
        .into_owned()
        .into_shape((batch, channels, spatial))
        .map_err(|_| EvalError::ShapeMismatch {
            label: "global_average_pool",
            expected: vec![batch, channels, spatial],
            actual: shape.clone(),
        })?;
    grouped
        .mean_axis(Axis(2))
        .ok_or(EvalError::ShapeMismatch {
            label: "global_average_pool",
            expected: vec![batch, channels, spatial],
            actual: shape,
        })
}

/// Adapter for 3D networks pretrained on medical volumes.
///
/// Whatever resolution the wrapped network ends on, its output is reduced by
/// global average pooling and flattened to one vector per input volume.
#[derive(Debug)]
pub struct VolumetricBackbone<N> {
    name: String,
    network: N,
}

impl<N: FeatureNetwork> VolumetricBackbone<N> {
    pub fn new(name: impl Into<String>, network: N) -> Self {
        Self {
            name: name.into(),
            network,
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }
}

impl<N: FeatureNetwork> Backbone for VolumetricBackbone<N> {
    fn name(&self) -> &str {
        &self.name
    }

    fn modality(&self) -> Modality {
        Modality::Volumetric
    }

    fn extract(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<Array2<f32>> {
        let size = check_batch_rank(&batch, Modality::Volumetric)?;
        let output = self.network.forward(batch)?;
        check_output(&output, size)?;
        ensure_finite(global_average_pool(output)?)
    }
}

/// Adapter for frozen 2D networks pretrained on natural images.
///
/// The raw pre-classification output is the embedding; it is only flattened
/// per batch element.
#[derive(Debug)]
pub struct SliceBackbone<N> {
    name: String,
    network: N,
}

impl<N: FeatureNetwork> SliceBackbone<N> {
    pub fn new(name: impl Into<String>, network: N) -> Self {
        Self {
            name: name.into(),
            network,
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }
}

impl<N: FeatureNetwork> Backbone for SliceBackbone<N> {
    fn name(&self) -> &str {
        &self.name
    }

    fn modality(&self) -> Modality {
        Modality::Slice2d
    }

    fn extract(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<Array2<f32>> {
        let size = check_batch_rank(&batch, Modality::Slice2d)?;
        let output = self.network.forward(batch)?;
        check_output(&output, size)?;
        let shape = output.shape().to_vec();
        let features = shape[1..].iter().product::<usize>();
        let flat = output
            .as_standard_layout()
            .into_owned()
            .into_shape((size, features))
            .map_err(|_| EvalError::ShapeMismatch {
                label: "slice_embedding",
                expected: vec![size, features],
                actual: shape,
            })?;
        ensure_finite(flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    /// Echoes its input, so the adapters' reductions are observable.
    struct Identity;

    impl FeatureNetwork for Identity {
        fn forward(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<ArrayD<f32>> {
            Ok(batch.to_owned())
        }
    }

    struct Poisoned;

    impl FeatureNetwork for Poisoned {
        fn forward(&self, batch: ArrayViewD<'_, f32>) -> EvalResult<ArrayD<f32>> {
            Ok(batch.mapv(|_| f32::NAN))
        }
    }

    #[test]
    fn volumetric_adapter_pools_to_one_vector_per_volume() {
        let backbone = VolumetricBackbone::new("identity-3d", Identity);
        let batch = Array::from_shape_fn(IxDyn(&[2, 3, 2, 2, 2]), |idx| {
            (idx[0] * 10 + idx[1]) as f32
        });
        let embedding = backbone.extract(batch.view()).unwrap();
        assert_eq!(embedding.shape(), &[2, 3]);
        assert_eq!(embedding[[1, 2]], 12.0);
    }

    #[test]
    fn slice_adapter_flattens_raw_output() {
        let backbone = SliceBackbone::new("identity-2d", Identity);
        let batch = ArrayD::<f32>::ones(IxDyn(&[1, 3, 4, 5]));
        let embedding = backbone.extract(batch.view()).unwrap();
        assert_eq!(embedding.shape(), &[1, 60]);
    }

    #[test]
    fn wrong_rank_is_rejected_before_inference() {
        let backbone = SliceBackbone::new("identity-2d", Identity);
        let batch = ArrayD::<f32>::ones(IxDyn(&[1, 3, 2, 4, 5]));
        assert!(matches!(
            backbone.extract(batch.view()),
            Err(EvalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn non_finite_embeddings_are_reported() {
        let backbone = VolumetricBackbone::new("poisoned", Poisoned);
        let batch = ArrayD::<f32>::ones(IxDyn(&[1, 1, 2, 2, 2]));
        assert!(matches!(
            backbone.extract(batch.view()),
            Err(EvalError::NonFinite { .. })
        ));
    }
}
