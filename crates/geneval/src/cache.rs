// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Resumable on-disk cache of per-sample embeddings.
//!
//! A cache directory holds one `feat_<index>.<ext>` record per sample of the
//! source that produced it, where `<index>` is the sample's position in the
//! source's iteration order. `manifest.json` is written only when an
//! extraction run reaches the end of its source and is removed when a new run
//! starts, so its presence marks a finished run.
//!
//! One writer per directory at a time; concurrent extraction runs against the
//! same directory are not coordinated.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Axis;
use serde::{Deserialize, Serialize};

use crate::backbone::Backbone;
use crate::format::{self, StorageFormat};
use crate::preprocess::Preprocess;
use crate::sample::{SampleSource, Sex};
use crate::{EvalError, EvalResult};

const RECORD_PREFIX: &str = "feat_";
const MANIFEST: &str = "manifest.json";

/// Embedding of one sample plus the metadata it was extracted with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub feature: Vec<f32>,
    pub age: f64,
    pub sex: Sex,
    pub source_index: usize,
}

/// Summary written when an extraction run finishes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub count: usize,
    pub feature_dim: Option<usize>,
    pub format: StorageFormat,
    pub backbone: String,
    pub preprocessor: String,
}

#[derive(Clone, Debug)]
pub struct FeatureCache {
    root: PathBuf,
    format: StorageFormat,
}

impl FeatureCache {
    /// Opens `root` for writing, creating it if needed.
    pub fn create(root: impl AsRef<Path>, format: StorageFormat) -> EvalResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| EvalError::io(&root, err))?;
        Ok(Self { root, format })
    }

    /// Opens an existing cache, taking the record format from its manifest or,
    /// failing that, from the records present.
    pub fn open(root: impl AsRef<Path>) -> EvalResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(EvalError::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "cache directory not found"),
            ));
        }
        let probe = Self {
            root,
            format: StorageFormat::default(),
        };
        if let Some(manifest) = probe.manifest()? {
            return Ok(Self {
                format: manifest.format,
                ..probe
            });
        }
        let mut formats = probe
            .scan()?
            .into_iter()
            .map(|entry| entry.format)
            .collect::<Vec<_>>();
        formats.sort_by_key(|format| format.extension());
        formats.dedup();
        match formats.as_slice() {
            [] => Ok(probe),
            [format] => Ok(Self {
                format: *format,
                ..probe
            }),
            _ => Err(EvalError::integrity(
                &probe.root,
                "records are stored in more than one format",
            )),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    pub fn record_path(&self, index: usize) -> PathBuf {
        self.root
            .join(format!("{RECORD_PREFIX}{index}.{}", self.format.extension()))
    }

    pub fn contains(&self, index: usize) -> bool {
        self.record_path(index).is_file()
    }

    pub fn write(&self, record: &FeatureRecord) -> EvalResult<()> {
        let path = self.record_path(record.source_index);
        format::write_value_atomic(&path, self.format, record)?;
        tracing::debug!(path = %path.display(), dim = record.feature.len(), "wrote feature record");
        Ok(())
    }

    pub fn read(&self, index: usize) -> EvalResult<FeatureRecord> {
        let path = self.record_path(index);
        if !path.is_file() {
            return Err(EvalError::MissingRecord {
                dir: self.root.clone(),
                index,
            });
        }
        let record: FeatureRecord = format::read_value(&path, self.format)?;
        if record.source_index != index {
            return Err(EvalError::integrity(
                &self.root,
                format!(
                    "{} stores source index {}",
                    path.display(),
                    record.source_index
                ),
            ));
        }
        Ok(record)
    }

    /// Indices of the records present in the cache's format, ascending.
    pub fn indices(&self) -> EvalResult<Vec<usize>> {
        let mut indices: Vec<usize> = self
            .scan()?
            .into_iter()
            .filter(|entry| entry.format == self.format)
            .map(|entry| entry.index)
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    fn scan(&self) -> EvalResult<Vec<ScannedRecord>> {
        let entries = fs::read_dir(&self.root).map_err(|err| EvalError::io(&self.root, err))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| EvalError::io(&self.root, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(format) = StorageFormat::from_path(&path) else {
                continue;
            };
            let index = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix(RECORD_PREFIX))
                .and_then(|digits| digits.parse::<usize>().ok());
            if let Some(index) = index {
                found.push(ScannedRecord {
                    index,
                    format,
                    path,
                });
            }
        }
        Ok(found)
    }

    pub fn manifest(&self) -> EvalResult<Option<CacheManifest>> {
        let path = self.root.join(MANIFEST);
        if !path.is_file() {
            return Ok(None);
        }
        format::read_value(&path, StorageFormat::Json).map(Some)
    }

    fn write_manifest(&self, manifest: &CacheManifest) -> EvalResult<()> {
        format::write_json_pretty(&self.root.join(MANIFEST), manifest)
    }

    fn clear_manifest(&self) -> EvalResult<()> {
        remove_if_present(&self.root.join(MANIFEST))
    }

    /// Deletes records in any format whose index passes `stale`. Returns how
    /// many were removed.
    fn remove_records(&self, stale: impl Fn(usize) -> bool) -> EvalResult<usize> {
        let mut removed = 0;
        for entry in self.scan()? {
            if stale(entry.index) {
                remove_if_present(&entry.path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

struct ScannedRecord {
    index: usize,
    format: StorageFormat,
    path: PathBuf,
}

fn remove_if_present(path: &Path) -> EvalResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(EvalError::io(path, err)),
    }
}

/// Outcome of one [`extract_to_cache`] run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    /// Samples the source yielded.
    pub total: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub feature_dim: Option<usize>,
}

/// Runs every sample of `source` through `preprocessor` and `backbone` and
/// stores one record per sample in `cache`.
///
/// The `i`-th sample of the pass is stored under index `i`. Without
/// `skip_existing` the run starts from an empty cache. With it, indices that
/// already hold a record are left untouched and cost neither preprocessing nor
/// inference; this resumes an interrupted run as long as the source replays
/// the same order. Records at or past the end of the source are removed
/// before the manifest is written. The first failure stops the run: records
/// before it stay on disk, nothing after it is attempted and the manifest is
/// not written.
pub fn extract_to_cache(
    source: &dyn SampleSource,
    cache: &FeatureCache,
    backbone: &dyn Backbone,
    preprocessor: &mut dyn Preprocess,
    skip_existing: bool,
) -> EvalResult<ExtractionSummary> {
    cache.clear_manifest()?;
    if !skip_existing {
        let removed = cache.remove_records(|_| true)?;
        if removed > 0 {
            tracing::info!(cache = %cache.root().display(), removed, "cleared previous records");
        }
    }
    let mut summary = ExtractionSummary::default();
    for (index, sample) in source.samples().enumerate() {
        let sample = sample?;
        summary.total += 1;
        if !sample.age.is_finite() {
            return Err(EvalError::NonFinite { label: "sample_age" });
        }
        if skip_existing && cache.contains(index) {
            tracing::info!(index, path = %cache.record_path(index).display(), "record exists, skipping");
            summary.skipped += 1;
            continue;
        }

        let input = preprocessor.transform(&sample)?.insert_axis(Axis(0));
        let embedding = backbone.extract(input.view())?;
        let feature = embedding.index_axis(Axis(0), 0).to_vec();
        match summary.feature_dim {
            Some(dim) if dim != feature.len() => {
                return Err(EvalError::ShapeMismatch {
                    label: "feature_dim",
                    expected: vec![dim],
                    actual: vec![feature.len()],
                });
            }
            _ => summary.feature_dim = Some(feature.len()),
        }

        cache.write(&FeatureRecord {
            feature,
            age: sample.age,
            sex: sample.sex,
            source_index: index,
        })?;
        summary.extracted += 1;
    }

    let total = summary.total;
    let stale = cache.remove_records(|index| index >= total)?;
    if stale > 0 {
        tracing::warn!(
            cache = %cache.root().display(),
            removed = stale,
            "removed records past the end of the source"
        );
    }
    if summary.feature_dim.is_none() && summary.total > 0 {
        summary.feature_dim = Some(cache.read(0)?.feature.len());
    }
    if summary.total == 0 {
        tracing::warn!(cache = %cache.root().display(), "sample source yielded no samples");
    }
    cache.write_manifest(&CacheManifest {
        count: summary.total,
        feature_dim: summary.feature_dim,
        format: cache.format(),
        backbone: backbone.name().to_string(),
        preprocessor: preprocessor.name().to_string(),
    })?;
    tracing::info!(
        cache = %cache.root().display(),
        total = summary.total,
        extracted = summary.extracted,
        skipped = summary.skipped,
        "feature extraction finished"
    );
    Ok(summary)
}
