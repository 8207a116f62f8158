// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! JSON run files describing one complete distance evaluation.
//!
//! ```json
//! {
//!   "modality": "volumetric",
//!   "weights": "weights/patch_embed.json",
//!   "real": { "samples": "data/real", "cache": "cache/real" },
//!   "fake": { "samples": "data/fake", "cache": "cache/fake" },
//!   "skip_existing": true,
//!   "seed": 7,
//!   "output": "report.json"
//! }
//! ```
//!
//! Relative paths are resolved against the directory holding the run file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::format::StorageFormat;
use crate::frechet::FrechetConfig;
use crate::network::load_backbone;
use crate::pipeline::{evaluate_distance, DistanceReport, EvaluationConfig};
use crate::preprocess::Modality;
use crate::sample::DirectorySource;
use crate::{EvalError, EvalResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory of stored samples.
    pub samples: PathBuf,
    /// Feature cache directory for this dataset.
    pub cache: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub modality: String,
    #[serde(default)]
    pub weights: Option<PathBuf>,
    pub real: DatasetConfig,
    pub fake: DatasetConfig,
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub record_format: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub frechet: FrechetConfig,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> EvalResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| EvalError::io(path, err))?;
        let mut config: Self =
            serde_json::from_str(&raw).map_err(|err| EvalError::serialization(path, err))?;
        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        for dataset in [&mut self.real, &mut self.fake] {
            resolve(&mut dataset.samples);
            resolve(&mut dataset.cache);
        }
        if let Some(weights) = self.weights.as_mut() {
            resolve(weights);
        }
        if let Some(output) = self.output.as_mut() {
            resolve(output);
        }
    }

    pub fn modality(&self) -> EvalResult<Modality> {
        self.modality.parse()
    }

    pub fn evaluation(&self) -> EvalResult<EvaluationConfig> {
        let record_format = match &self.record_format {
            Some(raw) => raw.parse()?,
            None => StorageFormat::default(),
        };
        self.frechet.validate()?;
        Ok(EvaluationConfig {
            modality: self.modality()?,
            skip_existing: self.skip_existing,
            record_format,
            seed: self.seed,
            frechet: self.frechet,
        })
    }

    pub fn weights_path(&self) -> EvalResult<&Path> {
        self.weights.as_deref().ok_or_else(|| {
            EvalError::Configuration("run file does not name a weights checkpoint".to_string())
        })
    }

    /// Loads the backbone and both sample directories, runs the evaluation
    /// and writes the report to `output` when one is set.
    pub fn execute(&self) -> EvalResult<DistanceReport> {
        let evaluation = self.evaluation()?;
        let backbone = load_backbone(evaluation.modality, self.weights_path()?)?;
        let real = DirectorySource::open(&self.real.samples)?;
        let fake = DirectorySource::open(&self.fake.samples)?;
        let report = evaluate_distance(
            &real,
            &fake,
            &self.real.cache,
            &self.fake.cache,
            backbone.as_ref(),
            &evaluation,
        )?;
        if let Some(output) = &self.output {
            report.write_json(output)?;
            tracing::info!(output = %output.display(), "wrote distance report");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RUN: &str = r#"{
        "modality": "2d-slice",
        "real": { "samples": "real", "cache": "/tmp/cache/real" },
        "fake": { "samples": "fake", "cache": "cache/fake" },
        "record_format": "bincode",
        "frechet": { "epsilon": 1e-4 }
    }"#;

    #[test]
    fn relative_paths_follow_the_run_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, RUN).unwrap();
        let config = RunConfig::from_path(&path).unwrap();
        assert_eq!(config.real.samples, dir.path().join("real"));
        assert_eq!(config.real.cache, PathBuf::from("/tmp/cache/real"));
        assert_eq!(config.fake.cache, dir.path().join("cache/fake"));

        let evaluation = config.evaluation().unwrap();
        assert_eq!(evaluation.modality, Modality::Slice2d);
        assert_eq!(evaluation.record_format, StorageFormat::Bincode);
        assert!(!evaluation.skip_existing);
        assert_eq!(evaluation.frechet.epsilon, 1e-4);
        assert_eq!(evaluation.frechet.condition_limit, 1e12);
    }

    #[test]
    fn missing_weights_is_a_configuration_error() {
        let config: RunConfig = serde_json::from_str(RUN).unwrap();
        assert!(matches!(
            config.weights_path(),
            Err(EvalError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_modality_is_reported() {
        let mut config: RunConfig = serde_json::from_str(RUN).unwrap();
        config.modality = "ultrasound".to_string();
        assert!(matches!(
            config.evaluation(),
            Err(EvalError::Configuration(_))
        ));
    }
}
