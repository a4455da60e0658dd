//! Sampled verification between the ERP database and its mirror.
//!
//! Each table is checked in two steps:
//!
//! - **Counts**: `COUNT(*)` on both sides, compared with a tolerance
//! - **Sample**: a seeded sample of source rows is fetched from the target
//!   by key and compared field by field
//!
//! Tables without a key only get the count check.

mod compare;
mod types;

pub use compare::values_equal;
pub use types::{DataIntegrityIssue, VerificationResult, VerificationStatus};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::catalog::TableDescriptor;
use crate::config::VerificationConfig;
use crate::core::{Row, SourceDatabase, SqlValue, TargetDatabase};
use crate::error::{Result, SyncError};
use crate::sync::project;

/// Key text of a row: the key values joined with `|`.
pub fn row_key(table: &TableDescriptor, row: &Row) -> String {
    table
        .key_indexes()
        .into_iter()
        .filter_map(|i| row.get(i))
        .map(SqlValue::key_text)
        .collect::<Vec<_>>()
        .join("|")
}

/// Compares tables between a source and a target.
pub struct Verifier {
    source: Arc<dyn SourceDatabase>,
    target: Arc<dyn TargetDatabase>,
    config: VerificationConfig,
}

/// What the sample comparison found.
struct SampleOutcome {
    checked: usize,
    matched: usize,
    issues: Vec<DataIntegrityIssue>,
    mismatches: usize,
}

impl Verifier {
    pub fn new(
        source: Arc<dyn SourceDatabase>,
        target: Arc<dyn TargetDatabase>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    /// Verify one table. Never fails: problems end up in the result.
    pub async fn verify_table(
        &self,
        table: &TableDescriptor,
        target_exists: bool,
        sample_size: usize,
    ) -> VerificationResult {
        let tolerance = self.config.row_count_tolerance;

        let ebp_rows = match self.source.count_rows(table).await {
            Ok(n) => n,
            Err(e) => {
                return VerificationResult::new(&table.name, 0, 0, tolerance)
                    .with_error(format!("source count failed: {}", e))
            }
        };

        if !target_exists {
            warn!("{}: missing in target", table.name);
            return VerificationResult::new(&table.name, ebp_rows, 0, tolerance)
                .with_error("target table missing");
        }

        let pg_rows = match self.target.count_rows(&table.name).await {
            Ok(n) => n,
            Err(e) => {
                return VerificationResult::new(&table.name, ebp_rows, 0, tolerance)
                    .with_error(format!("target count failed: {}", e))
            }
        };

        let result = VerificationResult::new(&table.name, ebp_rows, pg_rows, tolerance);
        if !table.has_key() {
            debug!("{}: no key, counts only", table.name);
            return result;
        }
        if sample_size == 0 || ebp_rows == 0 {
            return result;
        }

        let timeout = self.config.sample_timeout();
        let outcome =
            match tokio::time::timeout(timeout, self.compare_sample(table, sample_size)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => return result.with_error(e),
                Err(_) => {
                    return result.with_error(SyncError::timeout(
                        format!("sample of {}", table.name),
                        timeout.as_secs(),
                    ))
                }
            };

        let result = result.with_samples(
            outcome.checked,
            outcome.matched,
            outcome.issues,
            outcome.mismatches,
        );

        info!(
            table = %table.name,
            status = ?result.status(),
            "{}: {}/{} rows, {}/{} samples matched",
            table.name,
            pg_rows,
            ebp_rows,
            result.samples_matched,
            result.samples_checked
        );
        result
    }

    async fn compare_sample(
        &self,
        table: &TableDescriptor,
        sample_size: usize,
    ) -> Result<SampleOutcome> {
        let sampled = self
            .source
            .sample_rows(table, sample_size, self.config.seed)
            .await?;
        let sampled = project(table, sampled)?;

        let key_idx = table.key_indexes();
        let keys: Vec<Vec<SqlValue>> = sampled
            .iter()
            .map(|row| key_idx.iter().map(|&i| row[i].clone()).collect())
            .collect();

        let mirrored: HashMap<String, Row> = self
            .target
            .fetch_by_keys(table, &keys)
            .await?
            .into_iter()
            .map(|row| (row_key(table, &row), row))
            .collect();

        let cap = self.config.max_issues_per_table;
        let mut outcome = SampleOutcome {
            checked: 0,
            matched: 0,
            issues: Vec::new(),
            mismatches: 0,
        };
        let record = |issue: DataIntegrityIssue, outcome: &mut SampleOutcome| {
            outcome.mismatches += 1;
            if outcome.issues.len() < cap {
                outcome.issues.push(issue);
            }
        };

        for row in &sampled {
            outcome.checked += 1;
            let key = row_key(table, row);

            let Some(target_row) = mirrored.get(&key) else {
                record(
                    DataIntegrityIssue {
                        key: key.clone(),
                        column: "*".to_string(),
                        source_value: JsonValue::String(key),
                        target_value: JsonValue::Null,
                    },
                    &mut outcome,
                );
                continue;
            };

            let mut row_ok = true;
            for (idx, col) in table.columns.iter().enumerate() {
                if self.config.is_excluded(&col.name) {
                    continue;
                }
                let (src, tgt) = (&row[idx], &target_row[idx]);
                if !values_equal(src, tgt, self.config.numeric_epsilon) {
                    row_ok = false;
                    record(
                        DataIntegrityIssue {
                            key: key.clone(),
                            column: col.name.clone(),
                            source_value: src.to_json(),
                            target_value: tgt.to_json(),
                        },
                        &mut outcome,
                    );
                }
            }
            if row_ok {
                outcome.matched += 1;
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customer_rows, customer_table, simple_rows, simple_table};
    use crate::catalog::{build_source_descriptor, RawColumn};
    use crate::testing::{MemorySource, MemoryTarget};
    use std::time::Duration;

    fn verifier(source: MemorySource, target: Arc<MemoryTarget>) -> Verifier {
        Verifier::new(Arc::new(source), target, VerificationConfig::default())
    }

    fn mirrored(n: usize) -> (MemorySource, Arc<MemoryTarget>) {
        let source = MemorySource::new().with_table(customer_table(), customer_rows(n));
        let target = Arc::new(MemoryTarget::new());
        target.install(customer_table(), customer_rows(n));
        (source, target)
    }

    #[tokio::test]
    async fn test_identical_tables_are_ok() {
        let (source, target) = mirrored(200);
        let r = verifier(source, target)
            .verify_table(&customer_table(), true, 50)
            .await;
        assert_eq!(r.status(), VerificationStatus::Ok);
        assert_eq!(r.samples_checked, 50);
        assert_eq!(r.samples_matched, 50);
        assert!(r.data_integrity_issues.is_empty());
    }

    #[tokio::test]
    async fn test_sample_is_deterministic() {
        let (source, _) = mirrored(500);
        let table = customer_table();
        let a = source.sample_rows(&table, 20, 42).await.unwrap();
        let b = source.sample_rows(&table, 20, 42).await.unwrap();
        let c = source.sample_rows(&table, 20, 7).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_field_mismatch_reported() {
        let (source, target) = mirrored(10);
        target.set_value("Customer", 4, 1, SqlValue::Text("Changed".into()));
        let r = verifier(source, target)
            .verify_table(&customer_table(), true, 10)
            .await;

        assert_eq!(r.status(), VerificationStatus::Warning);
        assert_eq!(r.samples_matched, 9);
        assert_eq!(r.data_integrity_issues.len(), 1);
        let issue = &r.data_integrity_issues[0];
        assert_eq!(issue.column, "Name");
        assert_eq!(issue.source_value, "Customer 4");
        assert_eq!(issue.target_value, "Changed");
    }

    #[tokio::test]
    async fn test_missing_row_is_star_issue_and_count_error() {
        let (source, target) = mirrored(10);
        target.remove_row("Customer", 0);
        let r = verifier(source, target)
            .verify_table(&customer_table(), true, 10)
            .await;

        assert_eq!(r.status(), VerificationStatus::Error);
        assert_eq!(r.pg_row_count, 9);
        assert!(r.data_integrity_issues.iter().any(|i| i.column == "*"));
    }

    #[tokio::test]
    async fn test_excluded_column_not_compared() {
        let (source, target) = mirrored(5);
        for i in 0..5 {
            target.set_value("Customer", i, 1, SqlValue::Text("x".into()));
        }
        let config = VerificationConfig {
            excluded_columns: vec!["name".into()],
            ..Default::default()
        };
        let r = Verifier::new(Arc::new(source), target, config)
            .verify_table(&customer_table(), true, 5)
            .await;
        assert_eq!(r.status(), VerificationStatus::Ok);
    }

    #[tokio::test]
    async fn test_ebp_system_columns_ignored_by_default() {
        let table = build_source_descriptor(
            "dbo",
            "Item",
            vec![
                RawColumn {
                    is_nullable: false,
                    ..RawColumn::new("Id", "int")
                },
                RawColumn::new("sysModifiedDate", "datetime2"),
                RawColumn::new("sysEditCounter", "int"),
            ],
            0,
        );
        let stamp = |h| {
            chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap()
        };
        let rows = |h, counter| -> Vec<Row> {
            (1..=10)
                .map(|i| {
                    vec![
                        SqlValue::I32(i),
                        SqlValue::DateTime(stamp(h)),
                        SqlValue::I32(counter),
                    ]
                })
                .collect()
        };
        let source = MemorySource::new().with_table(table.clone(), rows(8, 1));
        let target = Arc::new(MemoryTarget::new());
        target.install(table.clone(), rows(17, 4));

        let r = verifier(source, target).verify_table(&table, true, 10).await;
        assert_eq!(r.status(), VerificationStatus::Ok);
        assert_eq!(r.samples_matched, 10);
    }

    #[tokio::test]
    async fn test_issue_cap_keeps_total() {
        let (source, target) = mirrored(20);
        for i in 0..20 {
            target.set_value("Customer", i, 1, SqlValue::Text("x".into()));
        }
        let config = VerificationConfig {
            max_issues_per_table: 5,
            ..Default::default()
        };
        let r = Verifier::new(Arc::new(source), target, config)
            .verify_table(&customer_table(), true, 20)
            .await;
        assert_eq!(r.data_integrity_issues.len(), 5);
        assert_eq!(r.total_mismatches, 20);
        assert_eq!(r.status(), VerificationStatus::Error);
    }

    #[tokio::test]
    async fn test_missing_target_table() {
        let source = MemorySource::new().with_table(customer_table(), customer_rows(3));
        let r = verifier(source, Arc::new(MemoryTarget::new()))
            .verify_table(&customer_table(), false, 10)
            .await;
        assert_eq!(r.status(), VerificationStatus::Error);
        assert_eq!(r.ebp_row_count, 3);
        assert_eq!(r.error.as_deref(), Some("target table missing"));
    }

    #[tokio::test]
    async fn test_keyless_table_counts_only() {
        let mut table = simple_table("Log");
        table.columns[0].is_primary_key = false;
        let source = MemorySource::new().with_table(table.clone(), simple_rows(4));
        let target = Arc::new(MemoryTarget::new());
        target.install(table.clone(), simple_rows(4));
        let r = verifier(source, target).verify_table(&table, true, 10).await;
        assert_eq!(r.status(), VerificationStatus::Ok);
        assert_eq!(r.samples_checked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_timeout_is_error() {
        struct SlowSource(MemorySource);

        #[async_trait::async_trait]
        impl SourceDatabase for SlowSource {
            async fn introspect(&self) -> Result<Vec<TableDescriptor>> {
                self.0.introspect().await
            }
            async fn count_rows(&self, table: &TableDescriptor) -> Result<i64> {
                self.0.count_rows(table).await
            }
            fn stream_rows(
                &self,
                table: &TableDescriptor,
                batch_size: usize,
            ) -> tokio::sync::mpsc::Receiver<Result<Vec<Row>>> {
                self.0.stream_rows(table, batch_size)
            }
            async fn sample_rows(
                &self,
                table: &TableDescriptor,
                sample_size: usize,
                seed: u64,
            ) -> Result<Vec<Row>> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                self.0.sample_rows(table, sample_size, seed).await
            }
            async fn ping(&self) -> Result<()> {
                Ok(())
            }
        }

        let (source, target) = mirrored(5);
        let r = Verifier::new(
            Arc::new(SlowSource(source)),
            target,
            VerificationConfig::default(),
        )
        .verify_table(&customer_table(), true, 5)
        .await;
        assert_eq!(r.status(), VerificationStatus::Error);
        assert_eq!(
            r.error.as_deref(),
            Some("TimeoutError: sample of Customer exceeded 60s")
        );
    }
}
