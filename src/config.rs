use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::DEFAULT_CANCEL_POLL_INTERVAL;
use crate::registry::DEFAULT_JOURNAL_PAGE_SIZE;

/// Per-session tuning, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum ids a single bulk removal leaves in the journal.
    pub journal_page_size: usize,
    /// How often a cancellable lock wait re-checks its token.
    pub cancel_poll_interval_ms: u64,
    /// Upper bound on how long a round-trip waits for the session lock.
    /// Unset means wait indefinitely.
    pub request_lock_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            journal_page_size: DEFAULT_JOURNAL_PAGE_SIZE,
            cancel_poll_interval_ms: DEFAULT_CANCEL_POLL_INTERVAL.as_millis() as u64,
            request_lock_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn request_lock_timeout(&self) -> Option<Duration> {
        self.request_lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}
