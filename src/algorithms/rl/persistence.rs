//! On-disk model format.
//!
//! Models are stored as a JSON [`ModelFile`]: an envelope with the format
//! version, the algorithm that wrote it, the hyperparameters and exploration
//! rate in force, and the learned parameters. Files are written to a
//! sibling temporary path and renamed into place, so a crash mid-write
//! never leaves a truncated model behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::config::RLConfig;
use super::error::{RLError, Result};
use super::network::NamedParams;

/// Version written by this crate; files with a different version are rejected.
pub const FORMAT_VERSION: u32 = 1;

/// Learned parameters carried by a [`ModelFile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelPayload {
    /// Tabular Q-values as `(state key, values per action)` rows.
    QTable {
        action_count: usize,
        entries: Vec<(u64, Vec<f64>)>,
    },
    /// Network parameters keyed by role (`"online"`, `"target"`, `"actor_critic"`).
    Networks {
        state_dim: usize,
        action_count: usize,
        networks: std::collections::BTreeMap<String, NamedParams>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub format_version: u32,
    pub algorithm: String,
    pub saved_at_step: u64,
    /// Identifier of the process run that wrote the file.
    pub run_id: crate::RunId,
    pub hyperparameters: RLConfig,
    pub exploration_rate: f64,
    pub payload: ModelPayload,
}

impl ModelFile {
    pub fn new(
        algorithm: impl Into<String>,
        saved_at_step: u64,
        hyperparameters: RLConfig,
        exploration_rate: f64,
        payload: ModelPayload,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            algorithm: algorithm.into(),
            saved_at_step,
            run_id: crate::run_id().to_string(),
            hyperparameters,
            exploration_rate,
            payload,
        }
    }

    /// Serializes to `path` atomically (temp file, fsync, rename).
    ///
    /// # Errors
    ///
    /// [`RLError::ModelIo`] on any I/O or serialization failure.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| RLError::model_io(path, e))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| RLError::model_io(path, e))?;
        }
        let tmp = temp_path(path);
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(RLError::model_io(path, e));
        }
        tracing::debug!(path = %path.display(), algorithm = %self.algorithm, "model written");
        Ok(())
    }

    /// Reads and version-checks a model file.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| RLError::model_io(path, e))?;
        let file: ModelFile =
            serde_json::from_slice(&bytes).map_err(|e| RLError::model_io(path, e))?;
        if file.format_version != FORMAT_VERSION {
            return Err(RLError::model_io(
                path,
                format!(
                    "unsupported format version {} (expected {FORMAT_VERSION})",
                    file.format_version
                ),
            ));
        }
        Ok(file)
    }

    /// Fails unless the file was written by `algorithm`.
    pub fn expect_algorithm(&self, algorithm: &str, path: &Path) -> Result<()> {
        if self.algorithm != algorithm {
            return Err(RLError::model_io(
                path,
                format!(
                    "file holds a `{}` model, expected `{algorithm}`",
                    self.algorithm
                ),
            ));
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
