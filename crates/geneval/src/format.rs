// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! On-disk encodings shared by feature records, manifests, checkpoints and
//! stored samples.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{EvalError, EvalResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    #[default]
    Json,
    Bincode,
}

impl StorageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Bincode => "bin",
        }
    }

    /// Infers the encoding from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "bin" | "bincode" => Some(Self::Bincode),
            _ => None,
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Bincode => f.write_str("bincode"),
        }
    }
}

impl FromStr for StorageFormat {
    type Err = EvalError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "bin" | "bincode" => Ok(Self::Bincode),
            other => Err(EvalError::Configuration(format!(
                "unknown storage format '{other}' (expected 'json' or 'bincode')"
            ))),
        }
    }
}

pub(crate) fn write_value<T: Serialize>(
    path: &Path,
    format: StorageFormat,
    value: &T,
) -> EvalResult<()> {
    let file = File::create(path).map_err(|err| EvalError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    match format {
        StorageFormat::Json => serde_json::to_writer(&mut writer, value)
            .map_err(|err| EvalError::serialization(path, err))?,
        StorageFormat::Bincode => bincode::serialize_into(&mut writer, value)
            .map_err(|err| EvalError::serialization(path, err))?,
    }
    let file = writer
        .into_inner()
        .map_err(|err| EvalError::io(path, err.into_error()))?;
    file.sync_all().map_err(|err| EvalError::io(path, err))
}

/// Writes `value` next to `path` and renames it into place, so readers never
/// observe a partially written file under the final name.
pub(crate) fn write_value_atomic<T: Serialize>(
    path: &Path,
    format: StorageFormat,
    value: &T,
) -> EvalResult<()> {
    replace_atomically(path, |staging| write_value(staging, format, value))
}

fn replace_atomically(
    path: &Path,
    write: impl FnOnce(&Path) -> EvalResult<()>,
) -> EvalResult<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| EvalError::Configuration(format!("invalid file path {}", path.display())))?;
    let staging = path.with_file_name(format!(".{file_name}.partial"));
    if let Err(err) = write(&staging) {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    fs::rename(&staging, path).map_err(|err| {
        let _ = fs::remove_file(&staging);
        EvalError::io(path, err)
    })
}

pub(crate) fn read_value<T: DeserializeOwned>(path: &Path, format: StorageFormat) -> EvalResult<T> {
    let file = File::open(path).map_err(|err| EvalError::io(path, err))?;
    let reader = BufReader::new(file);
    match format {
        StorageFormat::Json => {
            serde_json::from_reader(reader).map_err(|err| EvalError::serialization(path, err))
        }
        StorageFormat::Bincode => {
            bincode::deserialize_from(reader).map_err(|err| EvalError::serialization(path, err))
        }
    }
}

/// Pretty JSON for human-facing outputs (reports, manifests), replaced
/// atomically like the records.
pub(crate) fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> EvalResult<()> {
    let payload =
        serde_json::to_vec_pretty(value).map_err(|err| EvalError::serialization(path, err))?;
    replace_atomically(path, |staging| {
        let mut file = File::create(staging).map_err(|err| EvalError::io(staging, err))?;
        file.write_all(&payload)
            .and_then(|()| file.sync_all())
            .map_err(|err| EvalError::io(staging, err))
    })
}
