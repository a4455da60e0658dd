//! # ebp-pg-sync
//!
//! Mirror an EBP ERP database (Microsoft SQL Server) into PostgreSQL and
//! check that the mirror is faithful.
//!
//! - **Schema catalog** of both sides with a deterministic type mapping
//! - **Batched sync**, full or incremental, each batch its own transaction
//! - **Sampled verification** with seeded, reproducible samples
//! - **Repair** of flagged tables by incremental re-sync
//! - **Backups** with `pg_dump` before destructive reloads
//!
//! ## Example
//!
//! ```rust,no_run
//! use ebp_pg_sync::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> ebp_pg_sync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     let sync = orchestrator.run_full_sync(None, true).await?;
//!     let check = orchestrator.run_verification(None, Some(50)).await?;
//!     println!(
//!         "Synced {} rows, {} tables ok",
//!         sync.summary.total_rows_synced, check.summary.ok
//!     );
//!     Ok(())
//! }
//! ```

pub mod advisor;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod repair;
pub mod source;
pub mod sync;
pub mod target;
pub mod typemap;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use backup::{BackupFormat, BackupManifest, BackupOptions, PgDumpBackup, Snapshotter};
pub use catalog::{ColumnDescriptor, Relation, SchemaDiff, TableDescriptor};
pub use config::{Config, SourceConfig, TargetConfig};
pub use crate::core::{Row, SourceDatabase, SqlValue, TargetDatabase};
pub use error::{Result, SyncError};
pub use orchestrator::{
    create_target_backup, BackupReport, HealthReport, Orchestrator, SyncReport,
    VerificationReport,
};
pub use repair::RepairPlan;
pub use source::MssqlSource;
pub use sync::{SyncMode, SyncResult, SyncStatus};
pub use target::PgTarget;
pub use verify::{VerificationResult, VerificationStatus};
