//! Repair planning from verification results.
//!
//! Repair is always an incremental re-sync of the affected tables; a table
//! is never dropped to repair it.

use serde::{Deserialize, Serialize};

use crate::catalog::TableDescriptor;
use crate::sync::SyncMode;
use crate::verify::{VerificationResult, VerificationStatus};

/// Mode every repair runs in.
pub const REPAIR_MODE: SyncMode = SyncMode::Incremental;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAction {
    pub table_name: String,
    pub priority: RepairPriority,
    pub reason: String,
}

/// Tables to repair, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub actions: Vec<RepairAction>,
}

impl RepairPlan {
    /// Plan repairs for every result that is not `ok`.
    pub fn from_results(results: &[VerificationResult]) -> Self {
        let mut actions: Vec<RepairAction> = results
            .iter()
            .filter_map(|r| {
                let (priority, reason) = match r.status() {
                    VerificationStatus::Ok => return None,
                    VerificationStatus::Error => (
                        RepairPriority::High,
                        r.error.clone().unwrap_or_else(|| {
                            format!(
                                "{} source rows, {} target rows, {}/{} samples matched",
                                r.ebp_row_count,
                                r.pg_row_count,
                                r.samples_matched,
                                r.samples_checked
                            )
                        }),
                    ),
                    VerificationStatus::Warning if r.ebp_row_count != r.pg_row_count => (
                        RepairPriority::Medium,
                        format!(
                            "row count drift ({} vs {})",
                            r.ebp_row_count, r.pg_row_count
                        ),
                    ),
                    VerificationStatus::Warning => (
                        RepairPriority::Low,
                        format!("{} field mismatch(es)", r.total_mismatches),
                    ),
                };
                Some(RepairAction {
                    table_name: r.table_name.clone(),
                    priority,
                    reason,
                })
            })
            .collect();

        actions.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.table_name.cmp(&b.table_name))
        });

        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pick the planned tables from `tables`, in plan order.
    ///
    /// Planned tables that no longer exist in the source are skipped.
    pub fn select(&self, tables: &[TableDescriptor]) -> Vec<TableDescriptor> {
        self.actions
            .iter()
            .filter_map(|a| tables.iter().find(|t| t.name == a.table_name).cloned())
            .collect()
    }
}
