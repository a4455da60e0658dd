//! Operation reports returned to callers.
//!
//! Operations that ran to completion report `success: true` even when some
//! tables failed; per-table outcomes are in `results`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backup::BackupManifest;
use crate::sync::SyncResult;
use crate::verify::{VerificationResult, VerificationStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub total_tables: usize,
    pub success: usize,
    pub errors: usize,
    pub total_rows_synced: u64,
    pub total_duration_ms: u64,
}

/// Result of a full sync, incremental sync or repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub results: Vec<SyncResult>,
    pub summary: SyncSummary,
}

impl SyncReport {
    pub fn new(results: Vec<SyncResult>, total_duration_ms: u64) -> Self {
        let success = results.iter().filter(|r| r.is_success()).count();
        let summary = SyncSummary {
            total_tables: results.len(),
            success,
            errors: results.len() - success,
            total_rows_synced: results.iter().map(|r| r.rows_synced).sum(),
            total_duration_ms,
        };
        Self {
            success: true,
            results,
            summary,
        }
    }

    pub fn result(&self, table: &str) -> Option<&SyncResult> {
        self.results.iter().find(|r| r.table_name == table)
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub total_tables: usize,
    pub ok: usize,
    pub warnings: usize,
    pub errors: usize,
    /// Mismatching fields and missing rows across all tables.
    pub total_issues: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub success: bool,
    pub results: Vec<VerificationResult>,
    pub summary: VerificationSummary,
}

impl VerificationReport {
    pub fn new(results: Vec<VerificationResult>) -> Self {
        let count = |status| results.iter().filter(|r| r.status() == status).count();
        let summary = VerificationSummary {
            total_tables: results.len(),
            ok: count(VerificationStatus::Ok),
            warnings: count(VerificationStatus::Warning),
            errors: count(VerificationStatus::Error),
            total_issues: results.iter().map(|r| r.total_mismatches).sum(),
        };
        Self {
            success: true,
            results,
            summary,
        }
    }

    pub fn result(&self, table: &str) -> Option<&VerificationResult> {
        self.results.iter().find(|r| r.table_name == table)
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub success: bool,
    pub file_path: PathBuf,
    #[serde(rename = "sizeInMB")]
    pub size_in_mb: f64,
}

impl From<&BackupManifest> for BackupReport {
    fn from(manifest: &BackupManifest) -> Self {
        Self {
            success: true,
            file_path: manifest.file_path.clone(),
            // Two decimals are enough for a human reader.
            size_in_mb: (manifest.size_in_mb * 100.0).round() / 100.0,
        }
    }
}

/// Connectivity of both databases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
}
