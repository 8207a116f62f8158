// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! End-to-end distance evaluation: extract both datasets into their caches,
//! reload them and compare the embedding distributions.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backbone::Backbone;
use crate::cache::{extract_to_cache, ExtractionSummary, FeatureCache};
use crate::collection::FeatureMatrix;
use crate::format::{self, StorageFormat};
use crate::frechet::{frechet_distance, ConditioningReport, FrechetConfig};
use crate::preprocess::Modality;
use crate::sample::SampleSource;
use crate::{EvalError, EvalResult};

#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationConfig {
    pub modality: Modality,
    /// Resume into existing caches instead of recomputing every record.
    pub skip_existing: bool,
    pub record_format: StorageFormat,
    /// Seed for the background noise of volumetric preprocessing. `None`
    /// defers to the process-wide determinism settings.
    pub seed: Option<u64>,
    pub frechet: FrechetConfig,
}

impl EvaluationConfig {
    pub fn new(modality: Modality) -> Self {
        Self {
            modality,
            skip_existing: false,
            record_format: StorageFormat::default(),
            seed: None,
            frechet: FrechetConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DistanceReport {
    pub distance: f64,
    pub modality: Option<Modality>,
    pub backbone: Option<String>,
    pub real_cache: PathBuf,
    pub fake_cache: PathBuf,
    pub real_samples: usize,
    pub fake_samples: usize,
    pub feature_dim: usize,
    pub real_extraction: Option<ExtractionSummary>,
    pub fake_extraction: Option<ExtractionSummary>,
    pub conditioning: ConditioningReport,
}

impl DistanceReport {
    pub fn write_json(&self, path: impl AsRef<Path>) -> EvalResult<()> {
        format::write_json_pretty(path.as_ref(), self)
    }
}

fn extract_dataset(
    label: &str,
    source: &dyn SampleSource,
    dir: &Path,
    backbone: &dyn Backbone,
    config: &EvaluationConfig,
) -> EvalResult<(ExtractionSummary, FeatureMatrix)> {
    let cache = FeatureCache::create(dir, config.record_format)?;
    let rng = geneval_config::rng_from_optional(config.seed, &format!("preprocess/{label}"));
    let mut preprocessor = config.modality.preprocessor(rng);
    tracing::info!(dataset = label, cache = %dir.display(), "extracting features");
    let summary = extract_to_cache(
        source,
        &cache,
        backbone,
        preprocessor.as_mut(),
        config.skip_existing,
    )?;
    let matrix = FeatureMatrix::load_expected(&cache, summary.total)?;
    Ok((summary, matrix))
}

/// Extracts `real` into `real_dir` and `fake` into `fake_dir` with one shared
/// backbone, then measures the Fréchet distance between the two caches.
///
/// The real dataset is processed first. A failure leaves whatever records
/// were written in place so a later run with `skip_existing` can resume.
pub fn evaluate_distance(
    real: &dyn SampleSource,
    fake: &dyn SampleSource,
    real_dir: impl AsRef<Path>,
    fake_dir: impl AsRef<Path>,
    backbone: &dyn Backbone,
    config: &EvaluationConfig,
) -> EvalResult<DistanceReport> {
    if backbone.modality() != config.modality {
        return Err(EvalError::Configuration(format!(
            "backbone '{}' consumes {} input but the evaluation is configured for {}",
            backbone.name(),
            backbone.modality(),
            config.modality
        )));
    }
    config.frechet.validate()?;
    let (real_dir, fake_dir) = (real_dir.as_ref(), fake_dir.as_ref());

    let (real_summary, real_matrix) = extract_dataset("real", real, real_dir, backbone, config)?;
    let (fake_summary, fake_matrix) = extract_dataset("fake", fake, fake_dir, backbone, config)?;
    let report = frechet_distance(
        real_matrix.features(),
        fake_matrix.features(),
        &config.frechet,
    )?;
    tracing::info!(
        distance = report.distance,
        modality = %config.modality,
        backbone = backbone.name(),
        "distance evaluation finished"
    );
    Ok(DistanceReport {
        distance: report.distance,
        modality: Some(config.modality),
        backbone: Some(backbone.name().to_string()),
        real_cache: real_dir.to_path_buf(),
        fake_cache: fake_dir.to_path_buf(),
        real_samples: real_matrix.rows(),
        fake_samples: fake_matrix.rows(),
        feature_dim: real_matrix.dim(),
        real_extraction: Some(real_summary),
        fake_extraction: Some(fake_summary),
        conditioning: report.conditioning,
    })
}

/// Fréchet distance between two caches that were filled earlier.
pub fn compare_caches(
    real_dir: impl AsRef<Path>,
    fake_dir: impl AsRef<Path>,
    config: &FrechetConfig,
) -> EvalResult<DistanceReport> {
    let (real_dir, fake_dir) = (real_dir.as_ref(), fake_dir.as_ref());
    let real_cache = FeatureCache::open(real_dir)?;
    let fake_cache = FeatureCache::open(fake_dir)?;
    let backbones = (
        real_cache.manifest()?.map(|manifest| manifest.backbone),
        fake_cache.manifest()?.map(|manifest| manifest.backbone),
    );
    if let (Some(real), Some(fake)) = &backbones {
        if real != fake {
            tracing::warn!(real = %real, fake = %fake, "caches were extracted with different backbones");
        }
    }
    let real = FeatureMatrix::load(&real_cache)?;
    let fake = FeatureMatrix::load(&fake_cache)?;
    let report = frechet_distance(real.features(), fake.features(), config)?;
    Ok(DistanceReport {
        distance: report.distance,
        modality: None,
        backbone: backbones.0,
        real_cache: real_dir.to_path_buf(),
        fake_cache: fake_dir.to_path_buf(),
        real_samples: real.rows(),
        fake_samples: fake.rows(),
        feature_dim: real.dim(),
        real_extraction: None,
        fake_extraction: None,
        conditioning: report.conditioning,
    })
}
