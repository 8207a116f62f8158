// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Separable N-D kernels over `[leading..., spatial...]` arrays.

use ndarray::{ArrayD, ArrayView1, ArrayViewD, ArrayViewMut1, Axis, IxDyn, Zip};

fn map_lanes<F>(input: ArrayViewD<'_, f64>, axis: Axis, out_len: usize, mut f: F) -> ArrayD<f64>
where
    F: FnMut(ArrayView1<'_, f64>, ArrayViewMut1<'_, f64>),
{
    let mut shape = input.shape().to_vec();
    shape[axis.index()] = out_len;
    let mut out = ArrayD::<f64>::zeros(IxDyn(&shape));
    Zip::from(out.lanes_mut(axis))
        .and(input.lanes(axis))
        .for_each(|dst, src| f(src, dst));
    out
}

/// Non-overlapping mean pooling with a cubic `window` over every axis from
/// `first_spatial` on. Trailing elements that do not fill a window are dropped.
pub(crate) fn avg_pool(input: ArrayViewD<'_, f64>, window: usize, first_spatial: usize) -> ArrayD<f64> {
    let mut current = input.to_owned();
    if window <= 1 {
        return current;
    }
    let scale = 1.0 / window as f64;
    for axis in first_spatial..input.ndim() {
        let out_len = current.len_of(Axis(axis)) / window;
        current = map_lanes(current.view(), Axis(axis), out_len, |src, mut dst| {
            for (index, slot) in dst.iter_mut().enumerate() {
                let start = index * window;
                *slot = src.slice(ndarray::s![start..start + window]).sum() * scale;
            }
        });
    }
    current
}

/// "Valid" correlation with the same 1-D `kernel` along every axis from
/// `first_spatial` on; each filtered axis shrinks by `kernel.len() - 1`.
pub(crate) fn separable_filter(
    input: ArrayViewD<'_, f64>,
    kernel: &[f64],
    first_spatial: usize,
) -> ArrayD<f64> {
    let mut current = input.to_owned();
    for axis in first_spatial..input.ndim() {
        let len = current.len_of(Axis(axis));
        let out_len = (len + 1).saturating_sub(kernel.len());
        current = map_lanes(current.view(), Axis(axis), out_len, |src, mut dst| {
            for (index, slot) in dst.iter_mut().enumerate() {
                *slot = kernel
                    .iter()
                    .enumerate()
                    .map(|(offset, weight)| weight * src[index + offset])
                    .sum();
            }
        });
    }
    current
}

/// Normalised 1-D Gaussian taps centred on the middle of the window.
pub(crate) fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let centre = (size as f64 - 1.0) / 2.0;
    let taps: Vec<f64> = (0..size)
        .map(|i| {
            let x = (i as f64 - centre) / sigma;
            (-0.5 * x * x).exp()
        })
        .collect();
    let total: f64 = taps.iter().sum();
    taps.into_iter().map(|tap| tap / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array;

    #[test]
    fn pooling_averages_blocks_and_keeps_leading_axes() {
        let input = Array::from_shape_fn(IxDyn(&[2, 4, 4]), |idx| (idx[0] * 100 + idx[1] * 4 + idx[2]) as f64);
        let pooled = avg_pool(input.view(), 2, 1);
        assert_eq!(pooled.shape(), &[2, 2, 2]);
        // (0 + 1 + 4 + 5) / 4
        assert_relative_eq!(pooled[[0, 0, 0]], 2.5);
        assert_relative_eq!(pooled[[1, 1, 1]], 100.0 + 12.5);
    }

    #[test]
    fn pooling_drops_incomplete_windows() {
        let input = ArrayD::<f64>::ones(IxDyn(&[1, 5, 3, 7]));
        let pooled = avg_pool(input.view(), 2, 1);
        assert_eq!(pooled.shape(), &[1, 2, 1, 3]);
    }

    #[test]
    fn gaussian_taps_are_symmetric_and_normalised() {
        let taps = gaussian_kernel(9, 1.5);
        assert_eq!(taps.len(), 9);
        assert_relative_eq!(taps.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for i in 0..4 {
            assert_relative_eq!(taps[i], taps[8 - i], epsilon = 1e-15);
        }
        assert!(taps[4] > taps[3]);
    }

    #[test]
    fn valid_filter_preserves_constants() {
        let input = ArrayD::<f64>::from_elem(IxDyn(&[1, 10, 12]), 3.0);
        let out = separable_filter(input.view(), &gaussian_kernel(5, 1.0), 1);
        assert_eq!(out.shape(), &[1, 6, 8]);
        assert!(out.iter().all(|v| (v - 3.0).abs() < 1e-12));
    }
}
