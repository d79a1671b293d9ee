//! Node configuration.

use crate::observability::LogFormat;
use gitgate_git::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the Gitgate node.
///
/// Loaded from YAML; every field has a default, so a partial file is fine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Directory holding the served repositories.
    pub project_root: PathBuf,
    /// Log level.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Upper bound on waiting for a request body to arrive.
    pub body_timeout_secs: u64,
    /// Pack binary argv prefix; empty selects the platform binary.
    pub git_command: Vec<String>,
    /// Accept bodies without `content-length` once the stream ends.
    pub complete_on_eof: bool,
    /// Reject every push.
    pub read_only: bool,
    /// Users allowed to push; empty allows everyone.
    pub push_allowlist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            project_root: PathBuf::from("./repos"),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            body_timeout_secs: 60,
            git_command: Vec::new(),
            complete_on_eof: true,
            read_only: false,
            push_allowlist: Vec::new(),
        }
    }
}

impl Config {
    /// Reads a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parses a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Session settings derived from this configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            git_command: self.git_command.clone(),
            complete_on_eof: self.complete_on_eof,
        }
    }

    /// Body timeout as a duration.
    pub fn body_timeout(&self) -> Duration {
        Duration::from_secs(self.body_timeout_secs)
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid YAML for [`Config`].
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
