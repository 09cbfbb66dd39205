use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    COORDINATORS, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_NIP11_TIMEOUT_SECS, DEFAULT_POW_WORKERS,
    DEFAULT_PUBLISH_TIMEOUT_SECS, INDEX_RELAYS,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("powWorkers must be at least 1")]
    NoPowWorkers,

    #[error("indexRelays must contain at least one relay")]
    NoIndexRelays,
}

/// Core engine configuration, loadable from a JSON file.
/// Every field is optional in the file and falls back to the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Baseline discovery relays
    pub index_relays: Vec<String>,
    /// Selectable coordination endpoints; the first one is used by default
    pub coordinators: Vec<String>,
    /// Proof-of-work thread count
    pub pow_workers: usize,
    pub publish_timeout_secs: u64,
    pub nip11_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            index_relays: INDEX_RELAYS.iter().map(|s| s.to_string()).collect(),
            coordinators: COORDINATORS.iter().map(|s| s.to_string()).collect(),
            pow_workers: DEFAULT_POW_WORKERS,
            publish_timeout_secs: DEFAULT_PUBLISH_TIMEOUT_SECS,
            nip11_timeout_secs: DEFAULT_NIP11_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

impl CoreConfig {
    /// Load and validate config from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: CoreConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pow_workers == 0 {
            return Err(ConfigError::NoPowWorkers);
        }
        if self.index_relays.is_empty() {
            return Err(ConfigError::NoIndexRelays);
        }
        Ok(())
    }

    /// The coordination endpoint selected when the user has not chosen one
    pub fn default_coordinator(&self) -> Option<&str> {
        self.coordinators.first().map(String::as_str)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn nip11_timeout(&self) -> Duration {
        Duration::from_secs(self.nip11_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
