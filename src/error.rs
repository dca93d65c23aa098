use std::path::PathBuf;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read training state from {0}: {1}")]
    StateRead(PathBuf, #[source] std::io::Error),

    #[error("failed to parse training state from {0}: {1}")]
    StateParse(PathBuf, #[source] serde_json::Error),

    #[error("failed to save model: {0}")]
    ModelSave(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_error_display() {
        let err = CheckpointError::NotFound(PathBuf::from("checkpoints/mahjong_dqn"));
        assert_eq!(
            err.to_string(),
            "checkpoint not found: checkpoints/mahjong_dqn"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("learning_rate must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: learning_rate must be > 0"
        );
    }
}
