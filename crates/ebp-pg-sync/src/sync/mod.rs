//! Per-table sync: stream source rows in batches and commit each batch on
//! the target in its own transaction.
//!
//! A table runs its batches strictly one after another. Parallelism comes
//! from running several tables at once, which the orchestrator does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{diff_table, TableDescriptor};
use crate::core::{Row, SourceDatabase, TargetDatabase};
use crate::error::{Result, SyncError};

/// How a table is brought in line with the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SyncMode {
    /// Reload every row. With `drop_and_create` the table is recreated
    /// first, otherwise it is created when missing and truncated.
    Full { drop_and_create: bool },
    /// Upsert on the key; the source value wins on conflict. Rows missing
    /// from the source are left in place.
    Incremental,
}

impl SyncMode {
    fn label(&self) -> &'static str {
        match self {
            SyncMode::Full {
                drop_and_create: true,
            } => "full (drop and create)",
            SyncMode::Full { .. } => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
}

/// Outcome of one table in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub table_name: String,
    pub status: SyncStatus,
    /// Rows committed on the target, also when the table failed part way.
    pub rows_synced: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn success(table_name: impl Into<String>, rows_synced: u64, duration: Duration) -> Self {
        Self {
            table_name: table_name.into(),
            status: SyncStatus::Success,
            rows_synced,
            duration_ms: duration.as_millis() as u64,
            error: None,
        }
    }

    pub fn failure(
        table_name: impl Into<String>,
        rows_synced: u64,
        duration: Duration,
        error: impl ToString,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            status: SyncStatus::Error,
            rows_synced,
            duration_ms: duration.as_millis() as u64,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// Settings for the executor.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub table_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            table_timeout: Duration::from_secs(3600),
        }
    }
}

/// Syncs one table at a time between a source and a target.
pub struct SyncExecutor {
    source: Arc<dyn SourceDatabase>,
    target: Arc<dyn TargetDatabase>,
    options: SyncOptions,
    cancel: CancellationToken,
}

impl SyncExecutor {
    pub fn new(
        source: Arc<dyn SourceDatabase>,
        target: Arc<dyn TargetDatabase>,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            target,
            options,
            cancel,
        }
    }

    /// Sync one table and report the outcome. Never fails: every error ends
    /// up in the returned result.
    ///
    /// `existing` is the target's current descriptor for this table, `None`
    /// when the table does not exist yet.
    pub async fn sync_table(
        &self,
        table: &TableDescriptor,
        mode: SyncMode,
        existing: Option<&TableDescriptor>,
    ) -> SyncResult {
        let start = Instant::now();
        let committed = AtomicU64::new(0);

        info!("{}: starting {} sync", table.name, mode.label());

        let outcome = match tokio::time::timeout(
            self.options.table_timeout,
            self.run(table, mode, existing, &committed),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::timeout(
                format!("sync of {}", table.name),
                self.options.table_timeout.as_secs(),
            )),
        };

        let rows = committed.load(Ordering::Relaxed);
        match outcome {
            Ok(()) => {
                info!(
                    table = %table.name,
                    rows,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "{}: synced {} rows",
                    table.name,
                    rows
                );
                SyncResult::success(&table.name, rows, start.elapsed())
            }
            Err(e) => {
                error!(table = %table.name, rows, "{}: sync failed - {}", table.name, e);
                SyncResult::failure(&table.name, rows, start.elapsed(), e)
            }
        }
    }

    async fn run(
        &self,
        table: &TableDescriptor,
        mode: SyncMode,
        existing: Option<&TableDescriptor>,
        committed: &AtomicU64,
    ) -> Result<()> {
        self.prepare(table, mode, existing).await?;

        let mut batches = self
            .source
            .stream_rows(table, self.options.batch_size.max(1));

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(
                        "{}: cancelled after {} rows",
                        table.name,
                        committed.load(Ordering::Relaxed)
                    );
                    return Err(SyncError::Cancelled);
                }
                batch = batches.recv() => batch,
            };

            let Some(batch) = next else { break };
            let rows = project(table, batch?)?;
            if rows.is_empty() {
                continue;
            }

            let write = match mode {
                SyncMode::Incremental => self.target.upsert_batch(table, &rows).await,
                SyncMode::Full { .. } => self.target.insert_batch(table, &rows).await,
            };
            if let Err(e) = write {
                return Err(SyncError::batch_write(
                    &table.name,
                    committed.load(Ordering::Relaxed),
                    e,
                ));
            }

            let total = committed.fetch_add(rows.len() as u64, Ordering::Relaxed) + rows.len() as u64;
            debug!("{}: committed batch of {} ({} total)", table.name, rows.len(), total);
        }

        Ok(())
    }

    /// Bring the target table into shape before any row is written.
    async fn prepare(
        &self,
        table: &TableDescriptor,
        mode: SyncMode,
        existing: Option<&TableDescriptor>,
    ) -> Result<()> {
        match mode {
            SyncMode::Full {
                drop_and_create: true,
            } => self.target.recreate_table(table).await,
            SyncMode::Full {
                drop_and_create: false,
            } => match existing {
                Some(_) => self.target.truncate_table(&table.name).await,
                None => self.target.create_table(table).await,
            },
            SyncMode::Incremental => {
                if !table.has_key() {
                    return Err(SyncError::NoPrimaryKey(table.name.clone()));
                }
                match existing {
                    None => self.target.create_table(table).await,
                    Some(current) => {
                        let diff = diff_table(table, Some(current));
                        if diff.blocks_incremental() {
                            return Err(diff.into_error());
                        }
                        if !diff.type_mismatches.is_empty() {
                            warn!(
                                "{}: {} column type(s) differ from the mirror",
                                table.name,
                                diff.type_mismatches.len()
                            );
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Build target rows from source rows by walking the descriptor's columns.
///
/// Only descriptor columns are carried over, each converted to the kind of
/// its target column.
pub fn project(table: &TableDescriptor, rows: Vec<Row>) -> Result<Vec<Row>> {
    rows.into_iter()
        .map(|row| {
            if row.len() != table.columns.len() {
                return Err(SyncError::Conversion {
                    column: table.name.clone(),
                    message: format!(
                        "row has {} values, descriptor has {} columns",
                        row.len(),
                        table.columns.len()
                    ),
                });
            }
            table
                .columns
                .iter()
                .zip(row)
                .map(|(col, value)| col.target_type.coerce(&col.name, value))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use crate::testing::{customer_rows, customer_table, MemorySource, MemoryTarget};

    fn executor(source: MemorySource, target: Arc<MemoryTarget>) -> SyncExecutor {
        SyncExecutor::new(
            Arc::new(source),
            target,
            SyncOptions {
                batch_size: 1000,
                table_timeout: Duration::from_secs(30),
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_full_sync_drop_and_create() {
        let table = customer_table();
        let source = MemorySource::new().with_table(table.clone(), customer_rows(2500));
        let target = Arc::new(MemoryTarget::new());
        let result = executor(source, target.clone())
            .sync_table(&table, SyncMode::Full { drop_and_create: true }, None)
            .await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.rows_synced, 2500);
        assert_eq!(target.row_count("Customer"), 2500);
        assert_eq!(target.batches_written("Customer"), 3);
    }

    #[tokio::test]
    async fn test_full_sync_is_idempotent() {
        let table = customer_table();
        let source = MemorySource::new().with_table(table.clone(), customer_rows(10));
        let target = Arc::new(MemoryTarget::new());
        let exec = executor(source, target.clone());

        exec.sync_table(&table, SyncMode::Full { drop_and_create: false }, None)
            .await;
        let existing = target.descriptor("Customer");
        let second = exec
            .sync_table(
                &table,
                SyncMode::Full { drop_and_create: false },
                existing.as_ref(),
            )
            .await;

        assert!(second.is_success());
        assert_eq!(target.row_count("Customer"), 10);
    }

    #[tokio::test]
    async fn test_batch_failure_reports_committed_rows() {
        let table = customer_table();
        let source = MemorySource::new().with_table(table.clone(), customer_rows(3500));
        let target = Arc::new(MemoryTarget::new().fail_writes_after("Customer", 2));
        let result = executor(source, target.clone())
            .sync_table(&table, SyncMode::Full { drop_and_create: true }, None)
            .await;

        assert_eq!(result.status, SyncStatus::Error);
        assert_eq!(result.rows_synced, 2000);
        assert!(result
            .error
            .unwrap()
            .starts_with("BatchWriteError: Customer after 2000 rows"));
        assert_eq!(target.row_count("Customer"), 2000);
    }

    #[tokio::test]
    async fn test_incremental_missing_column_fails_fast() {
        let table = customer_table();
        let source = MemorySource::new().with_table(table.clone(), customer_rows(5));
        let target = Arc::new(MemoryTarget::new());
        let mut mirror = table.clone();
        mirror.columns.retain(|c| c.name != "Notes");
        target.install(mirror.clone(), Vec::new());

        let result = executor(source, target.clone())
            .sync_table(&table, SyncMode::Incremental, Some(&mirror))
            .await;

        assert_eq!(result.status, SyncStatus::Error);
        assert_eq!(result.rows_synced, 0);
        assert!(result
            .error
            .unwrap()
            .starts_with("SchemaMismatchError: column missing in target"));
        assert_eq!(target.row_count("Customer"), 0);
    }

    #[tokio::test]
    async fn test_incremental_source_wins_and_keeps_extra_rows() {
        let table = customer_table();
        let rows = customer_rows(3);
        let source = MemorySource::new().with_table(table.clone(), rows.clone());

        let mut stale = customer_rows(4);
        stale[0][1] = SqlValue::Text("Old name".into());
        let target = Arc::new(MemoryTarget::new());
        target.install(table.clone(), stale);

        let result = executor(source, target.clone())
            .sync_table(&table, SyncMode::Incremental, Some(&table))
            .await;

        assert!(result.is_success());
        assert_eq!(result.rows_synced, 3);
        // No delete propagation: the fourth target row survives.
        assert_eq!(target.row_count("Customer"), 4);
        let fetched = target.rows("Customer");
        assert!(fetched.contains(&rows[0]));
    }

    #[tokio::test]
    async fn test_incremental_requires_key() {
        let mut table = customer_table();
        for col in &mut table.columns {
            col.is_primary_key = false;
        }
        let source = MemorySource::new().with_table(table.clone(), Vec::new());
        let result = executor(source, Arc::new(MemoryTarget::new()))
            .sync_table(&table, SyncMode::Incremental, None)
            .await;
        assert!(result.error.unwrap().contains("no primary key"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let table = customer_table();
        let source = MemorySource::new().with_table(table.clone(), customer_rows(10));
        let target = Arc::new(MemoryTarget::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exec = SyncExecutor::new(
            Arc::new(source),
            target.clone(),
            SyncOptions::default(),
            cancel,
        );

        let result = exec
            .sync_table(&table, SyncMode::Full { drop_and_create: true }, None)
            .await;
        assert_eq!(result.error.as_deref(), Some("Operation cancelled"));
        assert_eq!(result.rows_synced, 0);
        // The table was recreated before streaming started.
        assert!(target.descriptor("Customer").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_timeout() {
        let table = customer_table();
        let source = MemorySource::new()
            .with_table(table.clone(), customer_rows(10))
            .stall("Customer");
        let exec = SyncExecutor::new(
            Arc::new(source),
            Arc::new(MemoryTarget::new()),
            SyncOptions {
                batch_size: 5,
                table_timeout: Duration::from_secs(2),
            },
            CancellationToken::new(),
        );

        let result = exec
            .sync_table(&table, SyncMode::Full { drop_and_create: true }, None)
            .await;
        assert_eq!(
            result.error.as_deref(),
            Some("TimeoutError: sync of Customer exceeded 2s")
        );
    }

    #[test]
    fn test_projection_rejects_row_shape_drift() {
        let table = customer_table();
        let err = project(&table, vec![vec![SqlValue::I32(1)]]).unwrap_err();
        assert!(matches!(err, SyncError::Conversion { .. }));
    }

    #[test]
    fn test_projection_coerces_to_target_kind() {
        let table = customer_table();
        let mut row = customer_rows(1).remove(0);
        row[3] = SqlValue::I32(7);
        let projected = project(&table, vec![row]).unwrap();
        assert_eq!(projected[0][3], SqlValue::Decimal(7.into()));
    }

    #[test]
    fn test_sync_result_json_shape() {
        let r = SyncResult::success("Customer", 10_000, Duration::from_millis(1500));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["tableName"], "Customer");
        assert_eq!(json["status"], "success");
        assert_eq!(json["rowsSynced"], 10_000);
        assert_eq!(json["durationMs"], 1500);
        assert!(json.get("error").is_none());
    }
}
