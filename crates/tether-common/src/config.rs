//! Client configuration for attach sessions.
//!
//! Values are read from a JSON file (`$TETHER_CONFIG`, or `config.json`
//! in the data directory). Missing files yield the defaults; CLI flags are
//! applied on top by the caller.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, TetherError};

/// Root configuration for the tether client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Key sequence that detaches from an attached container.
    pub detach_keys: String,
    /// Whether host signals are proxied to attached containers.
    pub sig_proxy: bool,
    /// Capacity of the signal proxy queue.
    pub signal_buffer: usize,
    /// Path to the attach state file.
    pub state_file: PathBuf,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            detach_keys: constants::DEFAULT_DETACH_KEYS.to_owned(),
            sig_proxy: true,
            signal_buffer: constants::SIGNAL_BUFFER_SIZE,
            state_file: constants::default_state_file(),
        }
    }
}

impl TetherConfig {
    /// Loads the configuration from `$TETHER_CONFIG` or the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file exists but cannot be read
    /// or parsed.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(constants::CONFIG_ENV)
            .map_or_else(constants::default_config_file, PathBuf::from);
        Self::load_from(&path)
    }

    /// Loads the configuration from `path`, falling back to defaults when
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| TetherError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config.normalized())
    }

    /// Raises the signal buffer to the minimum capacity if configured lower.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.signal_buffer < constants::SIGNAL_BUFFER_SIZE {
            tracing::warn!(
                configured = self.signal_buffer,
                minimum = constants::SIGNAL_BUFFER_SIZE,
                "signal buffer too small, using minimum"
            );
            self.signal_buffer = constants::SIGNAL_BUFFER_SIZE;
        }
        self
    }
}
