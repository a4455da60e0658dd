//! Sync orchestrator - sequences catalog, advisor, executor, verifier,
//! repairer and backups for each external operation.

mod report;
mod runlog;
mod session;

pub use report::{
    BackupReport, HealthReport, SyncReport, SyncSummary, VerificationReport, VerificationSummary,
};
pub use runlog::{record_run, RunLog, RunLogEntry};
pub use session::{check_reachable, credentials_fingerprint, Session};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::advisor::{self, SchemaAudit};
use crate::backup::{snapshot_with_retention, BackupOptions, PgDumpBackup, Snapshotter};
use crate::catalog::TableDescriptor;
use crate::config::Config;
use crate::core::{SourceDatabase, TargetDatabase};
use crate::error::{Result, SyncError};
use crate::repair::{RepairPlan, REPAIR_MODE};
use crate::source::MssqlSource;
use crate::sync::{SyncExecutor, SyncMode, SyncOptions, SyncResult};
use crate::target::PgTarget;
use crate::verify::{VerificationResult, Verifier};

/// Runs sync, verification, repair and backup operations against one
/// source/target pair.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceDatabase>,
    target: Arc<dyn TargetDatabase>,
    snapshotter: Arc<dyn Snapshotter>,
    session: Mutex<Session>,
    cancel: CancellationToken,
}

fn connection_error(side: &'static str) -> impl Fn(SyncError) -> SyncError {
    move |e| match e {
        SyncError::Configuration(_) => e,
        other => SyncError::Configuration(format!("{} database unreachable: {}", side, other)),
    }
}

impl Orchestrator {
    /// Open both pools and check that the databases answer.
    pub async fn connect(config: Config) -> Result<Self> {
        let source = MssqlSource::new(
            &config.source,
            config.sync.get_max_source_connections() as u32,
        )
        .await
        .map_err(connection_error("source"))?;
        let target = PgTarget::new(&config.target, config.sync.get_max_target_connections())
            .await
            .map_err(connection_error("target"))?
            .with_batch_size(config.sync.batch_size);

        let source: Arc<dyn SourceDatabase> = Arc::new(source);
        let target: Arc<dyn TargetDatabase> = Arc::new(target);
        let session = Session::establish(&config, source.as_ref(), target.as_ref()).await?;
        let snapshotter = Arc::new(PgDumpBackup::new(
            config.target.clone(),
            config.backup.clone(),
        ));

        Ok(Self {
            config,
            source,
            target,
            snapshotter,
            session: Mutex::new(session),
            cancel: CancellationToken::new(),
        })
    }

    /// Build an orchestrator over already connected databases.
    pub fn new(
        config: Config,
        source: Arc<dyn SourceDatabase>,
        target: Arc<dyn TargetDatabase>,
        snapshotter: Arc<dyn Snapshotter>,
    ) -> Self {
        let session = Session::new(&config);
        Self {
            config,
            source,
            target,
            snapshotter,
            session: Mutex::new(session),
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` to stop running operations.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Re-validate connectivity if the session expired.
    async fn ensure_session(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        session
            .refresh(&self.config, self.source.as_ref(), self.target.as_ref())
            .await
    }

    /// Source tables to work on, annotated and in sync priority order.
    ///
    /// `names` restricts the set; an unknown name is a configuration error.
    async fn select_tables(&self, names: Option<&[String]>) -> Result<Vec<TableDescriptor>> {
        let mut tables = self.source.introspect().await?;

        if let Some(names) = names.filter(|n| !n.is_empty()) {
            for name in names {
                if !tables.iter().any(|t| t.name.eq_ignore_ascii_case(name)) {
                    return Err(SyncError::Configuration(format!(
                        "Unknown table '{}' in schema {}",
                        name, self.config.source.schema
                    )));
                }
            }
            tables.retain(|t| names.iter().any(|n| n.eq_ignore_ascii_case(&t.name)));
        }

        let before = tables.len();
        tables.retain(|t| !self.config.sync.is_excluded(&t.name));
        if tables.len() < before {
            debug!("Excluded {} table(s) by configuration", before - tables.len());
        }

        advisor::annotate(&mut tables);
        Ok(advisor::prioritize(tables))
    }

    /// Current target tables by name.
    async fn target_tables(&self) -> Result<HashMap<String, TableDescriptor>> {
        Ok(self
            .target
            .introspect()
            .await?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect())
    }

    /// Reload the selected tables. With `drop_and_create`, the tables that
    /// already exist on the target are snapshotted first and a failed
    /// snapshot aborts the run before anything is dropped.
    pub async fn run_full_sync(
        &self,
        tables: Option<&[String]>,
        drop_and_create: bool,
    ) -> Result<SyncReport> {
        let started_at = Utc::now();
        self.ensure_session().await?;

        let tables = self.select_tables(tables).await?;
        let existing = self.target_tables().await?;

        if drop_and_create {
            self.backup_before_drop(&tables, &existing).await?;
        }

        let report = self
            .sync_tables(tables, SyncMode::Full { drop_and_create }, existing)
            .await?;
        self.record("full_sync", started_at, &report.summary).await;
        Ok(report)
    }

    /// Upsert the selected tables on their keys.
    pub async fn run_incremental_sync(&self, tables: Option<&[String]>) -> Result<SyncReport> {
        let started_at = Utc::now();
        self.ensure_session().await?;

        let tables = self.select_tables(tables).await?;
        let existing = self.target_tables().await?;
        let report = self
            .sync_tables(tables, SyncMode::Incremental, existing)
            .await?;
        self.record("incremental_sync", started_at, &report.summary).await;
        Ok(report)
    }

    /// Compare the selected tables. `sample_size` defaults to the configured
    /// one.
    pub async fn run_verification(
        &self,
        tables: Option<&[String]>,
        sample_size: Option<usize>,
    ) -> Result<VerificationReport> {
        let started_at = Utc::now();
        self.ensure_session().await?;

        let sample_size = sample_size.unwrap_or(self.config.verification.sample_size);
        let tables = self.select_tables(tables).await?;
        let existing = self.target_tables().await?;

        let verifier = Arc::new(Verifier::new(
            self.source.clone(),
            self.target.clone(),
            self.config.verification.clone(),
        ));
        let workers = self.config.sync.get_workers().max(1);
        let semaphore = Arc::new(Semaphore::new(workers));

        info!(
            "Verifying {} tables (sample size {}) with {} workers",
            tables.len(),
            sample_size,
            workers
        );

        let mut handles = Vec::with_capacity(tables.len());
        for table in tables {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SyncError::pool(e, "verification worker slot"))?;
            let verifier = verifier.clone();
            let target_exists = existing.contains_key(table.target_name());
            let name = table.name.clone();
            let handle = tokio::spawn(async move {
                let result = verifier
                    .verify_table(&table, target_exists, sample_size)
                    .await;
                drop(permit);
                result
            });
            handles.push((name, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("{}: verification task failed: {}", name, e);
                    results.push(
                        VerificationResult::new(name, 0, 0, self.config.verification.row_count_tolerance)
                            .with_error(format!("verification task failed: {}", e)),
                    );
                }
            }
        }

        let report = VerificationReport::new(results);
        info!(
            "Verification complete: {} ok, {} warnings, {} errors, {} issues",
            report.summary.ok,
            report.summary.warnings,
            report.summary.errors,
            report.summary.total_issues
        );
        self.record("verification", started_at, &report.summary).await;
        Ok(report)
    }

    /// Re-sync, incrementally, every table a verification flagged.
    pub async fn run_repair(&self, verification: &[VerificationResult]) -> Result<SyncReport> {
        let started_at = Utc::now();
        self.ensure_session().await?;

        let plan = RepairPlan::from_results(verification);
        if plan.is_empty() {
            info!("Nothing to repair");
            let report = SyncReport::new(Vec::new(), 0);
            self.record("repair", started_at, &report.summary).await;
            return Ok(report);
        }

        for action in &plan.actions {
            info!(
                "Repair {:?}: {} ({})",
                action.priority, action.table_name, action.reason
            );
        }

        let available = self.select_tables(None).await?;
        let tables = plan.select(&available);
        if tables.len() < plan.actions.len() {
            warn!(
                "{} flagged table(s) no longer in the source, skipped",
                plan.actions.len() - tables.len()
            );
        }

        let existing = self.target_tables().await?;
        let report = self.sync_tables(tables, REPAIR_MODE, existing).await?;
        self.record("repair", started_at, &report.summary).await;
        Ok(report)
    }

    /// Snapshot the target on request.
    pub async fn create_backup(&self, options: BackupOptions) -> Result<BackupReport> {
        backup_and_record(&self.config, self.snapshotter.as_ref(), &options).await
    }

    /// Classify and score the whole source schema.
    pub async fn audit(&self) -> Result<SchemaAudit> {
        self.ensure_session().await?;
        let mut tables = self.source.introspect().await?;
        advisor::annotate(&mut tables);
        Ok(SchemaAudit::build(&tables))
    }

    /// Ping both databases. Never fails; problems are in the report.
    pub async fn health_check(&self) -> HealthReport {
        let start = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.target.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        HealthReport {
            healthy: source.is_ok() && target.is_ok(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
        }
    }

    async fn backup_before_drop(
        &self,
        tables: &[TableDescriptor],
        existing: &HashMap<String, TableDescriptor>,
    ) -> Result<()> {
        let to_save: Vec<String> = tables
            .iter()
            .map(|t| t.target_name().to_string())
            .filter(|name| existing.contains_key(name))
            .collect();

        if to_save.is_empty() {
            info!("No existing target tables to back up before drop");
            return Ok(());
        }

        let options = BackupOptions {
            format: self.config.backup.format,
            tables: to_save,
            ..Default::default()
        };
        let manifest =
            snapshot_with_retention(self.snapshotter.as_ref(), &options, &self.config.backup)
                .await
                .map_err(|e| match e {
                    SyncError::Backup(_) => e,
                    other => SyncError::Backup(other.to_string()),
                })?;
        info!(
            "Pre-sync backup of {} table(s) written to {}",
            manifest.tables.len(),
            manifest.file_path.display()
        );
        Ok(())
    }

    /// Fan tables out over the worker pool. Results come back in table
    /// order, one per table.
    async fn sync_tables(
        &self,
        tables: Vec<TableDescriptor>,
        mode: SyncMode,
        existing: HashMap<String, TableDescriptor>,
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let workers = self.config.sync.get_workers().max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let existing = Arc::new(existing);
        let executor = Arc::new(SyncExecutor::new(
            self.source.clone(),
            self.target.clone(),
            SyncOptions {
                batch_size: self.config.sync.batch_size,
                table_timeout: self.config.sync.table_timeout(),
            },
            self.cancel.clone(),
        ));

        info!("Syncing {} tables with {} workers", tables.len(), workers);

        let mut handles = Vec::with_capacity(tables.len());
        let mut skipped = Vec::new();
        for table in tables {
            if self.cancel.is_cancelled() {
                skipped.push(table.name);
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SyncError::pool(e, "sync worker slot"))?;

            let executor = executor.clone();
            let existing = existing.clone();
            let name = table.name.clone();
            let handle = tokio::spawn(async move {
                let current = existing.get(table.target_name());
                let result = executor.sync_table(&table, mode, current).await;
                drop(permit);
                result
            });
            handles.push((name, handle));
        }

        let mut results = Vec::with_capacity(handles.len() + skipped.len());
        for (name, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("{}: sync task failed: {}", name, e);
                    results.push(SyncResult::failure(
                        name,
                        0,
                        Duration::ZERO,
                        format!("sync task failed: {}", e),
                    ));
                }
            }
        }
        if !skipped.is_empty() {
            warn!("Cancellation requested, {} table(s) not started", skipped.len());
        }
        for name in skipped {
            results.push(SyncResult::failure(
                name,
                0,
                Duration::ZERO,
                SyncError::Cancelled,
            ));
        }

        let report = SyncReport::new(results, start.elapsed().as_millis() as u64);
        info!(
            "Sync complete: {}/{} tables, {} rows in {:.1}s",
            report.summary.success,
            report.summary.total_tables,
            report.summary.total_rows_synced,
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    async fn record<S: Serialize>(&self, operation: &str, started_at: DateTime<Utc>, summary: &S) {
        record_run(&self.config, operation, started_at, summary).await;
    }
}

/// Snapshot the target, prune old snapshots and log the operation.
async fn backup_and_record(
    config: &Config,
    snapshotter: &dyn Snapshotter,
    options: &BackupOptions,
) -> Result<BackupReport> {
    let started_at = Utc::now();
    let manifest = snapshot_with_retention(snapshotter, options, &config.backup).await?;
    let report = BackupReport::from(&manifest);
    record_run(config, "backup", started_at, &report).await;
    Ok(report)
}

/// Snapshot the target without opening the source database.
///
/// `pg_dump` connects on its own, so a backup works while the ERP server
/// is down.
pub async fn create_target_backup(config: &Config, options: BackupOptions) -> Result<BackupReport> {
    let snapshotter = PgDumpBackup::new(config.target.clone(), config.backup.clone());
    backup_and_record(config, &snapshotter, &options).await
}
