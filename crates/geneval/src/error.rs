// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type EvalResult<T> = Result<T, EvalError>;

/// Every failure the evaluation pipeline can surface.
///
/// None of these are recovered from internally: a failed extraction keeps the
/// records it already wrote and hands the error to the caller.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Invalid modality, storage format, missing weights path or a backbone
    /// that does not fit the selected modality.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Input for which the statistic is undefined (empty foreground, fewer
    /// than two samples, zero sampling budget, ...).
    #[error("degenerate input for {label}: {reason}")]
    DegenerateInput { label: &'static str, reason: String },
    /// A record in the contiguous index range of a cache is absent.
    #[error("feature cache {} is missing record {index}", .dir.display())]
    MissingRecord { dir: PathBuf, index: usize },
    /// The cache holds records that contradict each other or the manifest.
    #[error("feature cache {} is inconsistent: {reason}", .dir.display())]
    CacheIntegrity { dir: PathBuf, reason: String },
    /// Pretrained weights could not be loaded as a whole.
    #[error("failed to load checkpoint {}: {reason}", .path.display())]
    Checkpoint { path: PathBuf, reason: String },
    #[error("shape mismatch for {label}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        label: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("non-finite value encountered in {label}")]
    NonFinite { label: &'static str },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialise {}: {message}", .path.display())]
    Serialization { path: PathBuf, message: String },
}

impl EvalError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl AsRef<Path>, err: impl ToString) -> Self {
        Self::Serialization {
            path: path.as_ref().to_path_buf(),
            message: err.to_string(),
        }
    }

    pub(crate) fn degenerate(label: &'static str, reason: impl Into<String>) -> Self {
        Self::DegenerateInput {
            label,
            reason: reason.into(),
        }
    }

    pub(crate) fn integrity(dir: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::CacheIntegrity {
            dir: dir.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True for failures that a fresh extraction run would repair.
    pub fn requires_reextraction(&self) -> bool {
        matches!(self, Self::MissingRecord { .. } | Self::CacheIntegrity { .. })
    }
}
