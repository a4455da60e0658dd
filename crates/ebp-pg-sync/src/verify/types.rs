//! Verification result types.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Ok,
    Warning,
    Error,
}

/// One field that differs between source and target, or a missing row
/// (column `*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataIntegrityIssue {
    /// Key of the sampled row.
    pub key: String,
    pub column: String,
    pub source_value: JsonValue,
    pub target_value: JsonValue,
}

/// Outcome of verifying one table.
///
/// The status is always computed from the other fields; it is serialized
/// for readers but recomputed when a result is loaded back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "VerificationRecord")]
pub struct VerificationResult {
    pub table_name: String,
    status: VerificationStatus,
    pub ebp_row_count: i64,
    pub pg_row_count: i64,
    pub samples_checked: usize,
    pub samples_matched: usize,
    pub data_integrity_issues: Vec<DataIntegrityIssue>,
    /// Mismatches found, including those beyond the reported issue cap.
    pub total_mismatches: usize,
    pub row_count_tolerance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationRecord {
    table_name: String,
    #[serde(default)]
    ebp_row_count: i64,
    #[serde(default)]
    pg_row_count: i64,
    #[serde(default)]
    samples_checked: usize,
    #[serde(default)]
    samples_matched: usize,
    #[serde(default)]
    data_integrity_issues: Vec<DataIntegrityIssue>,
    #[serde(default)]
    total_mismatches: Option<usize>,
    #[serde(default)]
    row_count_tolerance: f64,
    #[serde(default)]
    error: Option<String>,
}

impl From<VerificationRecord> for VerificationResult {
    fn from(r: VerificationRecord) -> Self {
        let total = r
            .total_mismatches
            .unwrap_or(r.data_integrity_issues.len());
        VerificationResult::new(
            r.table_name,
            r.ebp_row_count,
            r.pg_row_count,
            r.row_count_tolerance,
        )
        .with_samples(
            r.samples_checked,
            r.samples_matched,
            r.data_integrity_issues,
            total,
        )
        .with_error_opt(r.error)
    }
}

impl VerificationResult {
    /// Result from row counts only.
    pub fn new(
        table_name: impl Into<String>,
        ebp_row_count: i64,
        pg_row_count: i64,
        row_count_tolerance: f64,
    ) -> Self {
        let mut result = Self {
            table_name: table_name.into(),
            status: VerificationStatus::Ok,
            ebp_row_count,
            pg_row_count,
            samples_checked: 0,
            samples_matched: 0,
            data_integrity_issues: Vec::new(),
            total_mismatches: 0,
            row_count_tolerance,
            error: None,
        };
        result.status = result.derive_status();
        result
    }

    /// Attach the outcome of the sample comparison.
    pub fn with_samples(
        mut self,
        checked: usize,
        matched: usize,
        issues: Vec<DataIntegrityIssue>,
        total_mismatches: usize,
    ) -> Self {
        self.samples_checked = checked;
        self.samples_matched = matched;
        self.data_integrity_issues = issues;
        self.total_mismatches = total_mismatches.max(self.data_integrity_issues.len());
        self.status = self.derive_status();
        self
    }

    /// Mark the table as not verifiable.
    pub fn with_error(self, error: impl ToString) -> Self {
        self.with_error_opt(Some(error.to_string()))
    }

    fn with_error_opt(mut self, error: Option<String>) -> Self {
        self.error = error;
        self.status = self.derive_status();
        self
    }

    pub fn status(&self) -> VerificationStatus {
        self.status
    }

    /// Whether the two row counts differ by more than the tolerance.
    pub fn counts_diverge(&self) -> bool {
        let diff = (self.ebp_row_count - self.pg_row_count).unsigned_abs() as f64;
        let allowed = self.row_count_tolerance * self.ebp_row_count.max(1) as f64;
        diff > allowed
    }

    fn derive_status(&self) -> VerificationStatus {
        if self.error.is_some()
            || self.counts_diverge()
            || (self.samples_checked > 0 && self.samples_matched == 0)
        {
            VerificationStatus::Error
        } else if self.total_mismatches > 0 || self.ebp_row_count != self.pg_row_count {
            VerificationStatus::Warning
        } else {
            VerificationStatus::Ok
        }
    }
}
