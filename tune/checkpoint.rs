//! The tuning checkpoint: every evaluated point and its loss, rewritten in full after
//! each evaluation so the file on disk is always a complete snapshot.

use crate::config::ParamValue;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// File name of the checkpoint inside a run's log directory.
pub const CHECKPOINT_FILE: &str = "hyperparameter_tuning_logs.json";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to read or write the tuning checkpoint: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the tuning checkpoint JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to move the tuning checkpoint into place: {0}")]
    PersistError(#[from] tempfile::PersistError),
    #[error("The checkpoint records {points} points but {losses} losses.")]
    Misaligned { points: usize, losses: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningCheckpoint {
    pub x_iters: Vec<Vec<ParamValue>>,
    pub func_vals: Vec<f64>,
}

impl TuningCheckpoint {
    pub fn new(x_iters: Vec<Vec<ParamValue>>, func_vals: Vec<f64>) -> Self {
        Self { x_iters, func_vals }
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let reader = BufReader::new(fs::File::open(path)?);
        let checkpoint: Self = serde_json::from_reader(reader)?;
        if checkpoint.x_iters.len() != checkpoint.func_vals.len() {
            return Err(CheckpointError::Misaligned {
                points: checkpoint.x_iters.len(),
                losses: checkpoint.func_vals.len(),
            });
        }
        log::debug!(
            "Loaded {} tuning evaluations from '{}'",
            checkpoint.len(),
            path.display()
        );
        Ok(checkpoint)
    }

    /// Replaces `path` with this checkpoint. The JSON is written to a sibling temporary
    /// file first and renamed over the target, so readers never see a partial file.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        temp.persist(path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.x_iters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x_iters.is_empty()
    }

    /// The recorded point with the lowest loss.
    pub fn best(&self) -> Option<(&[ParamValue], f64)> {
        self.x_iters
            .iter()
            .zip(&self.func_vals)
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(x, &loss)| (x.as_slice(), loss))
    }
}
