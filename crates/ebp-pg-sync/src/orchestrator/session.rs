//! Connection session threaded through every operation.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::core::{SourceDatabase, TargetDatabase};
use crate::error::{Result, SyncError};

/// Proof that both databases were reachable with the configured
/// credentials, valid for `ttl`.
#[derive(Debug, Clone)]
pub struct Session {
    fingerprint: String,
    established_at: Instant,
    ttl: Duration,
}

/// Hash of both endpoints and their credentials. Changes when any of them
/// changes, and never exposes a password.
pub fn credentials_fingerprint(config: &Config) -> String {
    let mut hasher = Sha256::new();
    for part in [
        config.source.host.as_str(),
        &config.source.port.to_string(),
        &config.source.database,
        &config.source.user,
        &config.source.password,
        &config.target.host,
        &config.target.port.to_string(),
        &config.target.database,
        &config.target.user,
        &config.target.password,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Ping both sides; any failure is a configuration error.
pub async fn check_reachable(source: &dyn SourceDatabase, target: &dyn TargetDatabase) -> Result<()> {
    source
        .ping()
        .await
        .map_err(|e| SyncError::Configuration(format!("source database unreachable: {}", e)))?;
    target
        .ping()
        .await
        .map_err(|e| SyncError::Configuration(format!("target database unreachable: {}", e)))?;
    Ok(())
}

impl Session {
    /// A session for connections that were just checked.
    pub fn new(config: &Config) -> Self {
        Self {
            fingerprint: credentials_fingerprint(config),
            established_at: Instant::now(),
            ttl: config.sync.session_ttl(),
        }
    }

    /// Check both databases and open a session.
    pub async fn establish(
        config: &Config,
        source: &dyn SourceDatabase,
        target: &dyn TargetDatabase,
    ) -> Result<Self> {
        check_reachable(source, target).await?;
        let session = Self::new(config);
        info!("Session {} established", session.fingerprint);
        Ok(session)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_expired(&self) -> bool {
        self.established_at.elapsed() >= self.ttl
    }

    /// Re-check connectivity when the session has expired or the
    /// credentials changed.
    pub async fn refresh(
        &mut self,
        config: &Config,
        source: &dyn SourceDatabase,
        target: &dyn TargetDatabase,
    ) -> Result<()> {
        let fingerprint = credentials_fingerprint(config);
        if !self.is_expired() && fingerprint == self.fingerprint {
            return Ok(());
        }
        debug!("Session {} expired, re-validating connections", self.fingerprint);
        *self = Self::establish(config, source, target).await?;
        Ok(())
    }
}
