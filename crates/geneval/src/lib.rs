// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Quality metrics for generated 2D/3D images.
//!
//! Two families of measurements are provided:
//!
//! * a Fréchet distance between the embedding distributions of a real and a
//!   generated dataset, with embeddings produced by a pretrained backbone
//!   and persisted in resumable per-sample feature caches;
//! * the mean pairwise MS-SSIM within one dataset, a diversity signal.
//!
//! ```no_run
//! use geneval::{load_backbone, evaluate_distance, DirectorySource, EvaluationConfig, Modality};
//!
//! # fn main() -> geneval::EvalResult<()> {
//! let backbone = load_backbone(Modality::Volumetric, "weights.json".as_ref())?;
//! let real = DirectorySource::open("data/real")?;
//! let fake = DirectorySource::open("data/fake")?;
//! let mut config = EvaluationConfig::new(Modality::Volumetric);
//! config.skip_existing = true;
//! let report = evaluate_distance(&real, &fake, "cache/real", "cache/fake", backbone.as_ref(), &config)?;
//! println!("distance = {}", report.distance);
//! # Ok(())
//! # }
//! ```

pub mod backbone;
pub mod cache;
pub mod checkpoint;
pub mod collection;
pub mod config;
mod error;
pub mod format;
pub mod frechet;
pub mod network;
mod ops;
pub mod pairwise;
pub mod pipeline;
pub mod preprocess;
pub mod sample;
pub mod ssim;

pub use backbone::{Backbone, FeatureNetwork, SliceBackbone, VolumetricBackbone};
pub use cache::{extract_to_cache, CacheManifest, ExtractionSummary, FeatureCache, FeatureRecord};
pub use checkpoint::Checkpoint;
pub use collection::FeatureMatrix;
pub use config::{DatasetConfig, RunConfig};
pub use error::{EvalError, EvalResult};
pub use format::StorageFormat;
pub use frechet::{
    frechet_distance, frechet_from_statistics, ConditioningReport, FrechetConfig, FrechetReport,
    GaussianStatistics,
};
pub use network::{load_backbone, PatchEmbedding};
pub use pairwise::{average_pairwise_similarity, pairwise_similarity_summary, SimilaritySummary};
pub use pipeline::{compare_caches, evaluate_distance, DistanceReport, EvaluationConfig};
pub use preprocess::{CentralSliceTransform, IntensityNormalizer, Modality, Preprocess};
pub use sample::{DirectorySource, InMemorySource, Sample, SampleSource, Sex, StoredSample};
pub use ssim::{ms_ssim, MsSsimConfig};
