use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nostr_sdk::prelude::Keys;
use serde::{Deserialize, Serialize};
use signet_core::nostr::{load_keys, needs_password};
use signet_core::CoreConfig;

const CONFIG_DIR: &str = "signet";
const CONFIG_FILE: &str = "config.json";

/// CLI configuration that can be loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Credentials for nostr authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,

    /// Coordination endpoint to use instead of the configured default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<String>,

    /// Engine settings; omitted fields keep their defaults
    #[serde(default)]
    pub core: CoreConfig,
}

/// Nostr credentials configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// nsec (unencrypted) or ncryptsec (encrypted) key
    pub key: String,

    /// Password for ncryptsec decryption (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl CliConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .core
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// `~/.config/signet/config.json` on Linux, the platform equivalent elsewhere
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load the explicit path if given, else the default file if it exists,
    /// else the built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Apply command-line overrides. Flags always win over file values.
    pub fn with_overrides(mut self, nsec: Option<String>, coordinator: Option<String>) -> Self {
        if let Some(key) = nsec {
            self.credentials = Some(Credentials {
                key,
                password: None,
            });
        }
        if coordinator.is_some() {
            self.coordinator = coordinator;
        }
        self
    }

    /// Decode the configured key, decrypting it if it is an ncryptsec.
    pub fn keys(&self) -> Result<Keys> {
        let Some(credentials) = &self.credentials else {
            bail!("No key configured. Pass --nsec, set SIGNET_NSEC or add credentials to the config file");
        };
        if needs_password(&credentials.key) && credentials.password.is_none() {
            bail!("Encrypted key requires a password in the config file");
        }
        load_keys(&credentials.key, credentials.password.as_deref())
    }
}
