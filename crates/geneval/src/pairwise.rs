// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use serde::Serialize;

use crate::sample::SampleSource;
use crate::ssim::{ms_ssim, MsSsimConfig};
use crate::{EvalError, EvalResult};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SimilaritySummary {
    pub mean: f64,
    pub pairs: usize,
}

/// Mean MS-SSIM over ordered pairs `(i, j)`, `i != j`, of `source`.
///
/// Pairs are visited row by row (`i` outer, `j` inner, both in source order)
/// and the walk stops once `sample_budget` pairs have been scored, so small
/// budgets only ever see the lowest indices. Each inner row is a fresh pass
/// over the source; only two samples are held at a time.
pub fn pairwise_similarity_summary(
    source: &dyn SampleSource,
    sample_budget: usize,
    config: &MsSsimConfig,
) -> EvalResult<SimilaritySummary> {
    if sample_budget == 0 {
        return Err(EvalError::degenerate(
            "pairwise_similarity",
            "sample budget must be at least one pair",
        ));
    }
    config.validate()?;

    let mut total = 0.0;
    let mut pairs = 0usize;
    'outer: for (i, first) in source.samples().enumerate() {
        let first = first?;
        for (j, second) in source.samples().enumerate() {
            if pairs >= sample_budget {
                break 'outer;
            }
            if i == j {
                continue;
            }
            let second = second?;
            let score = ms_ssim(
                first.volume().into_dyn(),
                second.volume().into_dyn(),
                config,
            )?;
            tracing::trace!(i, j, score, "pair scored");
            total += score;
            pairs += 1;
        }
    }

    if pairs == 0 {
        return Err(EvalError::degenerate(
            "pairwise_similarity",
            "at least two samples are needed to form a pair",
        ));
    }
    let mean = total / pairs as f64;
    tracing::info!(pairs, mean, "pairwise similarity finished");
    Ok(SimilaritySummary { mean, pairs })
}

/// Scalar form of [`pairwise_similarity_summary`].
pub fn average_pairwise_similarity(
    source: &dyn SampleSource,
    sample_budget: usize,
    config: &MsSsimConfig,
) -> EvalResult<f64> {
    pairwise_similarity_summary(source, sample_budget, config).map(|summary| summary.mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{InMemorySource, Sample, Sex};
    use approx::assert_relative_eq;
    use ndarray::Array4;

    fn config() -> MsSsimConfig {
        MsSsimConfig {
            kernel_size: 3,
            kernel_sigma: 1.0,
            weights: vec![1.0],
            ..MsSsimConfig::default()
        }
    }

    fn pattern(offset: usize) -> Sample {
        let volume = Array4::from_shape_fn((1, 6, 6, 6), |(_, d, h, w)| {
            ((d + h + w + offset) % 5) as f32 / 5.0
        });
        Sample::new(volume, 40.0, Sex::Unknown).unwrap()
    }

    #[test]
    fn zero_budget_fails_before_reading() {
        let source = InMemorySource::new(vec![pattern(0), pattern(1)]);
        assert!(matches!(
            average_pairwise_similarity(&source, 0, &config()),
            Err(EvalError::DegenerateInput { .. })
        ));
    }

    #[test]
    fn single_sample_has_no_pairs() {
        let source = InMemorySource::new(vec![pattern(0)]);
        assert!(matches!(
            average_pairwise_similarity(&source, 10, &config()),
            Err(EvalError::DegenerateInput { .. })
        ));
    }

    #[test]
    fn budget_caps_pairs_in_row_order() {
        let source: InMemorySource = (0..4).map(pattern).collect();
        let summary = pairwise_similarity_summary(&source, 5, &config()).unwrap();
        assert_eq!(summary.pairs, 5);

        // Rows: (0,1) (0,2) (0,3) (1,0) (1,2).
        let expected = [(0, 1), (0, 2), (0, 3), (1, 0), (1, 2)]
            .iter()
            .map(|&(i, j)| {
                ms_ssim(
                    pattern(i).volume().into_dyn(),
                    pattern(j).volume().into_dyn(),
                    &config(),
                )
                .unwrap()
            })
            .sum::<f64>()
            / 5.0;
        assert_relative_eq!(summary.mean, expected, epsilon = 1e-12);
    }

    #[test]
    fn large_budget_scores_every_ordered_pair() {
        let source: InMemorySource = (0..3).map(pattern).collect();
        let summary = pairwise_similarity_summary(&source, 1_000, &config()).unwrap();
        assert_eq!(summary.pairs, 6);
    }
}
