//! Store configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/cellar/config.toml)
//! 3. Environment variables (CELLAR_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::params::ParameterSet;

/// Environment variable prefix
const ENV_PREFIX: &str = "CELLAR";

/// Store configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Store directory (required)
    #[serde(default)]
    pub path: PathBuf,

    /// Committer name recorded with writes
    #[serde(default)]
    pub committer_name: Option<String>,

    /// Committer email recorded with writes
    #[serde(default)]
    pub committer_email: Option<String>,

    /// Working database; `None` opens the container only
    #[serde(default)]
    pub database: Option<String>,

    /// Descriptor parameter overrides, applied after the built-in defaults
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Config {
    /// Configuration for a store directory with no identity and no database
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_committer(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.committer_name = Some(name.into());
        self.committer_email = Some(email.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (CELLAR_PATH, CELLAR_COMMITTER_NAME, ...)
    /// 2. Config file (~/.config/cellar/config.toml or CELLAR_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_PATH", ENV_PREFIX)) {
            self.path = PathBuf::from(val);
        }

        // Empty string clears the optional fields
        let optional = |name: &str| {
            std::env::var(format!("{}_{}", ENV_PREFIX, name))
                .ok()
                .map(|val| if val.is_empty() { None } else { Some(val) })
        };

        if let Some(val) = optional("COMMITTER_NAME") {
            self.committer_name = val;
        }
        if let Some(val) = optional("COMMITTER_EMAIL") {
            self.committer_email = val;
        }
        if let Some(val) = optional("DATABASE") {
            self.database = val;
        }
    }

    /// Save configuration to a file
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CELLAR_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cellar")
            .join("config.toml")
    }

    /// Check the fields the store cannot do without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingPath);
        }
        if let Some(database) = self.database() {
            validate_database_name(database)?;
        }
        Ok(())
    }

    /// Selected database, treating an empty name as none
    pub fn database(&self) -> Option<&str> {
        non_empty(&self.database)
    }

    pub fn committer_name(&self) -> Option<&str> {
        non_empty(&self.committer_name)
    }

    pub fn committer_email(&self) -> Option<&str> {
        non_empty(&self.committer_email)
    }

    /// Parameter overrides from the config file
    pub fn param_overrides(&self) -> ParameterSet {
        self.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Database names become directory names inside the store
pub fn validate_database_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidDatabaseName(name.to_string()))
    }
}
