//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::backup::BackupFormat;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (EBP on MSSQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL mirror).
    pub target: TargetConfig,

    /// Sync behavior.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Sampled verification.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Pre-sync snapshots.
    #[serde(default)]
    pub backup: BackupConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.sync = self.sync.with_auto_tuning(&resources);
        self
    }
}

/// Source database (MSSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Source schema (default: "dbo").
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Sync behavior configuration.
/// Performance fields use Option<T> to distinguish between "not set"
/// (auto-tuned) and "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tables synced concurrently. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Rows per batch; each batch is its own transaction (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Time budget for one table sync in seconds (default: 3600).
    #[serde(default = "default_table_timeout")]
    pub table_timeout_secs: u64,

    /// Maximum MSSQL connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_connections: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_target_connections: Option<usize>,

    /// Tables never synced, compared case-insensitively.
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Append one JSON line per operation to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_log: Option<PathBuf>,

    /// Seconds before the connection session is re-validated (default: 1800).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: None,
            batch_size: default_batch_size(),
            table_timeout_secs: default_table_timeout(),
            max_source_connections: None,
            max_target_connections: None,
            exclude_tables: Vec::new(),
            run_log: None,
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl SyncConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Both databases are remote; leave headroom on small machines.
        let workers = *self
            .workers
            .get_or_insert_with(|| resources.cpu_cores.saturating_sub(2).clamp(2, 16));

        // Pools must never be smaller than the worker count.
        if self.max_source_connections.is_none() {
            self.max_source_connections = Some((workers * 2).clamp(4, 64));
        }
        if self.max_target_connections.is_none() {
            self.max_target_connections = Some((workers * 2).clamp(4, 64));
        }

        info!(
            "Auto-tuned config: workers={}, batch_size={}, mssql_conns={}, pg_conns={}",
            workers,
            self.batch_size,
            self.get_max_source_connections(),
            self.get_max_target_connections(),
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_max_source_connections(&self) -> usize {
        self.max_source_connections
            .unwrap_or_else(|| self.get_workers() * 2)
    }

    pub fn get_max_target_connections(&self) -> usize {
        self.max_target_connections
            .unwrap_or_else(|| self.get_workers() * 2)
    }

    pub fn table_timeout(&self) -> Duration {
        Duration::from_secs(self.table_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Check whether a table is excluded from syncing.
    pub fn is_excluded(&self, table: &str) -> bool {
        self.exclude_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }
}

/// Sampled verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Rows sampled per table (default: 100).
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Seed that fixes which rows are sampled (default: 42).
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Allowed relative row count drift before a table is an error (default: 0).
    #[serde(default)]
    pub row_count_tolerance: f64,

    /// Numeric comparison epsilon (default: 1e-4).
    #[serde(default = "default_epsilon")]
    pub numeric_epsilon: f64,

    /// Time budget for one sample fetch in seconds (default: 60).
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_secs: u64,

    /// Columns never compared, case-insensitive. Defaults to the EBP
    /// bookkeeping columns; setting the key replaces the whole list.
    #[serde(default = "default_excluded_columns")]
    pub excluded_columns: Vec<String>,

    /// Issues kept per table (default: 50).
    #[serde(default = "default_max_issues")]
    pub max_issues_per_table: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            seed: default_seed(),
            row_count_tolerance: 0.0,
            numeric_epsilon: default_epsilon(),
            sample_timeout_secs: default_sample_timeout(),
            excluded_columns: default_excluded_columns(),
            max_issues_per_table: default_max_issues(),
        }
    }
}

impl VerificationConfig {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }

    /// Check whether a column is excluded from comparison.
    pub fn is_excluded(&self, column: &str) -> bool {
        self.excluded_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Backup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory receiving dump files (default: "backup").
    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,

    /// Explicit pg_dump executable. Looked up on PATH when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_dump_path: Option<PathBuf>,

    /// Format used for automatic pre-sync snapshots (default: custom).
    #[serde(default)]
    pub format: BackupFormat,

    /// Snapshots kept by cleanup (default: 10).
    #[serde(default = "default_keep")]
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_dir(),
            pg_dump_path: None,
            format: BackupFormat::default(),
            keep: default_keep(),
        }
    }
}

/// Columns EBP rewrites on its own (audit stamps, edit counters, sync
/// markers). Their values drift between source and mirror without any
/// data change.
pub const EBP_SYSTEM_COLUMNS: &[&str] = &[
    "sysCreatedDate",
    "sysCreatedUser",
    "sysModifiedDate",
    "sysModifiedUser",
    "sysEditCounter",
    "sysRecordVersion",
    "sysRecordVersionId",
    "CreatedByDocumentId",
    "CreatedByExecutionQuote",
    "CreatedBySoftware",
    "CreatedBySystem",
    "CreatedFromConstructionSiteConsumptions",
    "CreatedMaintenanceContractId",
    "IsCostAmountModifiedByNextDocument",
    "IsModified",
    "ModifiedObjectId",
    "ModifiedSinceRecovery",
    "NextScheduledItemPriceUpdateDate",
    "PriceModifiedDate",
    "QuantityUserModified",
    "ReportModifiedDate",
    "SalePriceModifiedDate",
    "SalePriceModifiedUserId",
    "ScheduledUpdateDate",
    "SynchronizationDate",
    "SynchronizationUniqueId",
    "isCreated",
    "lastSynchroDate",
];

fn default_excluded_columns() -> Vec<String> {
    EBP_SYSTEM_COLUMNS.iter().map(|c| c.to_string()).collect()
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1_000
}

fn default_table_timeout() -> u64 {
    3_600
}

fn default_session_ttl() -> u64 {
    1_800
}

fn default_sample_size() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

fn default_epsilon() -> f64 {
    1e-4
}

fn default_sample_timeout() -> u64 {
    60
}

fn default_max_issues() -> usize {
    50
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backup")
}

fn default_keep() -> usize {
    10
}
