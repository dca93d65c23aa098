use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ai::{DqnLearner, StepLrSchedule};
use crate::config::CheckpointConfig;
use crate::error::CheckpointError;

/// Schedule and counter state persisted next to the network weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    pub epsilon: f32,
    pub train_count: usize,
    /// Replay buffer size at save time. Informational only; transitions are
    /// not persisted.
    pub buffer_size: usize,
    pub learning_rate: f64,
    pub scheduler: StepLrSchedule,
}

/// Persists and restores checkpoints. A checkpoint is a directory holding the
/// online/target network records, the optimizer record, and
/// `training_state.json`. Saves are staged in a sibling `.tmp` directory and
/// renamed into place so a crash mid-save never corrupts an existing
/// checkpoint.
pub struct CheckpointStore {
    config: CheckpointConfig,
}

impl CheckpointStore {
    pub fn new(config: CheckpointConfig) -> Self {
        CheckpointStore { config }
    }

    /// Default checkpoint directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// A timestamped sibling of the default path, for backup copies.
    pub fn backup_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let name = match self.config.path.file_name() {
            Some(name) => format!("{}_{stamp}", name.to_string_lossy()),
            None => format!("checkpoint_{stamp}"),
        };
        self.config.path.with_file_name(name)
    }

    /// Write a complete checkpoint to `path`, replacing whatever was there.
    pub fn save(
        &self,
        learner: &DqnLearner,
        buffer_size: usize,
        path: &Path,
    ) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let staging = path.with_extension("tmp");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        learner.save_records(&staging)?;

        let state = learner.training_state(buffer_size);
        let json = serde_json::to_string_pretty(&state)?;
        fs::write(staging.join("training_state.json"), json)?;

        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        fs::rename(&staging, path)?;

        info!(
            path = %path.display(),
            train_count = state.train_count,
            epsilon = state.epsilon,
            "saved checkpoint"
        );
        Ok(())
    }

    /// Restore a checkpoint from `path` into the learner, applying the reset
    /// policies to the restored schedules.
    pub fn load(
        &self,
        learner: &mut DqnLearner,
        path: &Path,
        reset_learning_rate: bool,
        reset_exploration: bool,
    ) -> Result<(), CheckpointError> {
        if !path.is_dir() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }

        let state_path = path.join("training_state.json");
        let json = fs::read_to_string(&state_path)
            .map_err(|e| CheckpointError::StateRead(state_path.clone(), e))?;
        let state: TrainingState = serde_json::from_str(&json)
            .map_err(|e| CheckpointError::StateParse(state_path, e))?;

        learner.load_records(path)?;
        learner.restore_training_state(&state, reset_learning_rate, reset_exploration);

        info!(
            path = %path.display(),
            train_count = state.train_count,
            epsilon = learner.epsilon(),
            lr = learner.learning_rate(),
            "loaded checkpoint"
        );
        Ok(())
    }
}
