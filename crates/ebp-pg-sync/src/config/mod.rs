//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Environment variable overriding `source.password`.
pub const SOURCE_PASSWORD_ENV: &str = "SYNC_SOURCE_PASSWORD";

/// Environment variable overriding `target.password`.
pub const TARGET_PASSWORD_ENV: &str = "SYNC_TARGET_PASSWORD";

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Replace passwords with the values of the override variables, if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(pw) = std::env::var(SOURCE_PASSWORD_ENV) {
            self.source.password = pw;
        }
        if let Ok(pw) = std::env::var(TARGET_PASSWORD_ENV) {
            self.target.password = pw;
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration, recorded in the run log.
    ///
    /// Passwords are not serialized and therefore never part of the hash.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
