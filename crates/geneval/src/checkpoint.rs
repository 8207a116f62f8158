// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::format::{self, StorageFormat};
use crate::{EvalError, EvalResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_array(array: &ArrayD<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct CheckpointFile {
    parameters: BTreeMap<String, StoredTensor>,
}

/// Named parameter tensors of a pretrained network.
///
/// Loading is all-or-nothing: the consumer takes every parameter it needs
/// with [`Checkpoint::take`] and then calls [`Checkpoint::finish`], which
/// rejects leftovers. Nothing is ever substituted for a missing tensor.
#[derive(Clone, Debug, Default)]
pub struct Checkpoint {
    origin: PathBuf,
    parameters: BTreeMap<String, StoredTensor>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a checkpoint; the encoding follows the file extension.
    pub fn load(path: impl AsRef<Path>) -> EvalResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(EvalError::Checkpoint {
                path: path.to_path_buf(),
                reason: "file does not exist".to_string(),
            });
        }
        let format = StorageFormat::from_path(path).ok_or_else(|| EvalError::Checkpoint {
            path: path.to_path_buf(),
            reason: "unrecognised extension (expected .json or .bin)".to_string(),
        })?;
        let file: CheckpointFile =
            format::read_value(path, format).map_err(|err| EvalError::Checkpoint {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        tracing::debug!(
            path = %path.display(),
            parameters = file.parameters.len(),
            "loaded checkpoint"
        );
        Ok(Self {
            origin: path.to_path_buf(),
            parameters: file.parameters,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> EvalResult<()> {
        let path = path.as_ref();
        let format = StorageFormat::from_path(path).unwrap_or_default();
        let file = CheckpointFile {
            parameters: self.parameters.clone(),
        };
        format::write_value(path, format, &file)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: &ArrayD<f32>) {
        self.parameters
            .insert(name.into(), StoredTensor::from_array(tensor));
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    fn error(&self, reason: String) -> EvalError {
        EvalError::Checkpoint {
            path: self.origin.clone(),
            reason,
        }
    }

    /// Removes `name` and checks its rank.
    pub fn take(&mut self, name: &str, rank: usize) -> EvalResult<ArrayD<f32>> {
        let stored = self
            .parameters
            .remove(name)
            .ok_or_else(|| self.error(format!("missing parameter '{name}'")))?;
        if stored.shape.len() != rank {
            return Err(self.error(format!(
                "parameter '{name}' has shape {:?}, expected rank {rank}",
                stored.shape
            )));
        }
        let shape = stored.shape.clone();
        ArrayD::from_shape_vec(IxDyn(&stored.shape), stored.data).map_err(|_| {
            self.error(format!(
                "parameter '{name}' payload does not match its shape {shape:?}"
            ))
        })
    }

    /// Fails if parameters remain that no layer consumed.
    pub fn finish(self) -> EvalResult<()> {
        if self.parameters.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = self.parameters.keys().map(String::as_str).collect();
        Err(self.error(format!("unexpected parameters: {}", names.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_a_checkpoint_error() {
        let err = Checkpoint::load("/nonexistent/weights.json").unwrap_err();
        assert!(matches!(err, EvalError::Checkpoint { .. }));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn parameters_survive_bincode_storage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let mut ckpt = Checkpoint::new();
        ckpt.insert("layer.weight", &ArrayD::from_elem(IxDyn(&[2, 3]), 0.5));
        ckpt.save(&path).unwrap();

        let mut restored = Checkpoint::load(&path).unwrap();
        let weight = restored.take("layer.weight", 2).unwrap();
        assert_eq!(weight.shape(), &[2, 3]);
        restored.finish().unwrap();
    }

    #[test]
    fn leftovers_and_rank_errors_are_fatal() {
        let mut ckpt = Checkpoint::new();
        ckpt.insert("a", &ArrayD::zeros(IxDyn(&[4])));
        ckpt.insert("b", &ArrayD::zeros(IxDyn(&[4])));
        assert!(ckpt.take("a", 2).is_err());
        let err = ckpt.finish().unwrap_err();
        assert!(err.to_string().contains("unexpected parameters: b"));
    }

    #[test]
    fn garbage_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Checkpoint::load(&path).unwrap_err();
        match err {
            EvalError::Checkpoint { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error {other}"),
        }
    }
}
