use std::path::{Path, PathBuf};

use crate::ai::DqnConfig;
use crate::error::ConfigError;

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dqn: DqnConfig,
    pub checkpoint: CheckpointConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            dqn: DqnConfig::default(),
            checkpoint: CheckpointConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Where checkpoints live and how restored schedules are treated.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Default checkpoint directory.
    pub path: PathBuf,
    /// On restore, restart the learning-rate schedule from the persisted rate
    /// (or from `dqn.lr_restart` when that rate fell below `dqn.lr_floor`).
    pub reset_learning_rate: bool,
    /// On restore, set epsilon to `dqn.epsilon_restart`.
    pub reset_exploration: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            path: PathBuf::from("checkpoints/mahjong_dqn"),
            reset_learning_rate: true,
            reset_exploration: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 50051,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            eprintln!(
                "Warning: config file '{}' not found, using defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dqn.input_dim == 0 {
            return Err(ConfigError::Validation("dqn.input_dim must be > 0".into()));
        }
        if self.dqn.hidden_dim < 2 {
            return Err(ConfigError::Validation(
                "dqn.hidden_dim must be >= 2".into(),
            ));
        }
        if self.dqn.dropout < 0.0 || self.dqn.dropout >= 1.0 {
            return Err(ConfigError::Validation(
                "dqn.dropout must be in [0, 1)".into(),
            ));
        }
        if self.dqn.learning_rate <= 0.0 {
            return Err(ConfigError::Validation(
                "dqn.learning_rate must be > 0".into(),
            ));
        }
        if self.dqn.weight_decay < 0.0 {
            return Err(ConfigError::Validation(
                "dqn.weight_decay must be >= 0".into(),
            ));
        }
        if self.dqn.gamma < 0.0 || self.dqn.gamma > 1.0 {
            return Err(ConfigError::Validation("dqn.gamma must be in [0, 1]".into()));
        }
        if self.dqn.batch_size == 0 {
            return Err(ConfigError::Validation("dqn.batch_size must be > 0".into()));
        }
        if self.dqn.replay_capacity < self.dqn.batch_size {
            return Err(ConfigError::Validation(
                "dqn.replay_capacity must be >= dqn.batch_size".into(),
            ));
        }

        // Epsilon schedule
        if self.dqn.epsilon_start < 0.0 || self.dqn.epsilon_start > 1.0 {
            return Err(ConfigError::Validation(
                "dqn.epsilon_start must be in [0, 1]".into(),
            ));
        }
        if self.dqn.epsilon_min < 0.0 || self.dqn.epsilon_min > 1.0 {
            return Err(ConfigError::Validation(
                "dqn.epsilon_min must be in [0, 1]".into(),
            ));
        }
        if self.dqn.epsilon_min > self.dqn.epsilon_start {
            return Err(ConfigError::Validation(
                "dqn.epsilon_min must be <= dqn.epsilon_start".into(),
            ));
        }
        if self.dqn.epsilon_decay <= 0.0 || self.dqn.epsilon_decay > 1.0 {
            return Err(ConfigError::Validation(
                "dqn.epsilon_decay must be in (0, 1]".into(),
            ));
        }
        if self.dqn.epsilon_restart < 0.0 || self.dqn.epsilon_restart > 1.0 {
            return Err(ConfigError::Validation(
                "dqn.epsilon_restart must be in [0, 1]".into(),
            ));
        }

        // Learning-rate schedule
        if self.dqn.lr_step_size == 0 {
            return Err(ConfigError::Validation(
                "dqn.lr_step_size must be > 0".into(),
            ));
        }
        if self.dqn.lr_gamma <= 0.0 || self.dqn.lr_gamma > 1.0 {
            return Err(ConfigError::Validation(
                "dqn.lr_gamma must be in (0, 1]".into(),
            ));
        }
        if self.dqn.lr_restart <= 0.0 {
            return Err(ConfigError::Validation("dqn.lr_restart must be > 0".into()));
        }

        if self.dqn.update_target_every == 0 {
            return Err(ConfigError::Validation(
                "dqn.update_target_every must be > 0".into(),
            ));
        }
        if self.dqn.save_every == 0 {
            return Err(ConfigError::Validation("dqn.save_every must be > 0".into()));
        }
        if self.dqn.max_grad_norm <= 0.0 {
            return Err(ConfigError::Validation(
                "dqn.max_grad_norm must be > 0".into(),
            ));
        }

        if self.server.host.is_empty() {
            return Err(ConfigError::Validation(
                "server.host must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&AppConfig::default()).expect("default config serializes")
    }
}
