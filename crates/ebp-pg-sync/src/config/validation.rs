//! Configuration validation.

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::error::{Result, SyncError};

/// Upper bound for `sync.batch_size`; PostgreSQL allows 65535 bind parameters
/// per statement and wide tables need room.
const MAX_BATCH_SIZE: usize = 100_000;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(SyncError::Configuration("source.host is required".into()));
    }
    if config.source.port == 0 {
        return Err(SyncError::Configuration("source.port must be non-zero".into()));
    }
    if config.source.database.is_empty() {
        return Err(SyncError::Configuration("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(SyncError::Configuration("source.user is required".into()));
    }
    validate_identifier(&config.source.schema)?;

    // Target validation
    if config.target.host.is_empty() {
        return Err(SyncError::Configuration("target.host is required".into()));
    }
    if config.target.port == 0 {
        return Err(SyncError::Configuration("target.port must be non-zero".into()));
    }
    if config.target.database.is_empty() {
        return Err(SyncError::Configuration("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(SyncError::Configuration("target.user is required".into()));
    }
    validate_identifier(&config.target.schema)?;
    crate::target::SslMode::parse(&config.target.ssl_mode)?;

    // Cannot mirror into the same database
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(SyncError::Configuration(
            "source and target cannot be the same database".into(),
        ));
    }

    // Sync validation - performance knobs only checked if explicitly set
    let sync = &config.sync;
    if let Some(0) = sync.workers {
        return Err(SyncError::Configuration(
            "sync.workers must be at least 1".into(),
        ));
    }
    if sync.batch_size == 0 || sync.batch_size > MAX_BATCH_SIZE {
        return Err(SyncError::Configuration(format!(
            "sync.batch_size must be between 1 and {}",
            MAX_BATCH_SIZE
        )));
    }
    if sync.table_timeout_secs == 0 {
        return Err(SyncError::Configuration(
            "sync.table_timeout_secs must be at least 1".into(),
        ));
    }
    let workers = sync.get_workers();
    if sync.get_max_source_connections() < workers {
        return Err(SyncError::Configuration(format!(
            "sync.max_source_connections ({}) must be at least sync.workers ({})",
            sync.get_max_source_connections(),
            workers
        )));
    }
    if sync.get_max_target_connections() < workers {
        return Err(SyncError::Configuration(format!(
            "sync.max_target_connections ({}) must be at least sync.workers ({})",
            sync.get_max_target_connections(),
            workers
        )));
    }

    // Verification validation
    let verification = &config.verification;
    if verification.sample_size == 0 {
        return Err(SyncError::Configuration(
            "verification.sample_size must be at least 1".into(),
        ));
    }
    if !(0.0..=1.0).contains(&verification.row_count_tolerance) {
        return Err(SyncError::Configuration(
            "verification.row_count_tolerance must be between 0 and 1".into(),
        ));
    }
    if verification.numeric_epsilon.is_nan() || verification.numeric_epsilon < 0.0 {
        return Err(SyncError::Configuration(
            "verification.numeric_epsilon must be non-negative".into(),
        ));
    }
    if verification.sample_timeout_secs == 0 {
        return Err(SyncError::Configuration(
            "verification.sample_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}
