use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
}

/// Sink selection, fixed once per process. `Direct` writes go straight to
/// the durable store and are the only path eligible for uniqueness lookups;
/// `Queue` buffers statements for an external drain consumer.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Direct,
    Queue,
}

fn default_redacted_params() -> Vec<String> {
    [
        "passw",
        "secret",
        "token",
        "api_key",
        "access_key",
        "crypt",
        "salt",
        "otp",
        "ssn",
        "cvv",
    ]
    .iter()
    .map(|key| key.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImprintConfig {
    pub storage: StorageMode,
    /// Parameter keys stripped from `params` before a statement is built.
    /// Matching is case-insensitive substring, so `token` also covers
    /// `auth_token` and `tokenized_card`.
    #[serde(default = "default_redacted_params")]
    pub redacted_params: Vec<String>,
    /// Extra user-agent signatures treated as bots, on top of the builtin
    /// table in `bots.rs`.
    pub bot_signatures: Vec<String>,
    /// Optional JSONL event log; absent means no event logging.
    pub log_file: Option<PathBuf>,
}

impl Default for ImprintConfig {
    fn default() -> Self {
        Self {
            storage: StorageMode::default(),
            redacted_params: default_redacted_params(),
            bot_signatures: Vec::new(),
            log_file: None,
        }
    }
}

impl ImprintConfig {
    pub fn validate(&self) -> Result<(), String> {
        for key in &self.redacted_params {
            if key.trim().is_empty() {
                return Err("redacted_params entries must be non-empty".to_string());
            }
        }
        for signature in &self.bot_signatures {
            if signature.trim().is_empty() {
                return Err("bot_signatures entries must be non-empty".to_string());
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<ImprintConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: ImprintConfig = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    config.validate().map_err(ConfigError::Settings)?;
    Ok(config)
}
