//! Machine-readable schema audit snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{infer_relations, BusinessDomain, InferredRelation, CRITICAL_IMPORTANCE};
use crate::catalog::TableDescriptor;
use crate::error::Result;

/// Per-domain totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSummary {
    pub table_count: usize,
    pub row_count: i64,
    pub tables: Vec<String>,
}

/// One line of the critical tables list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSummary {
    pub name: String,
    pub domain: BusinessDomain,
    pub importance: u32,
    pub row_count: i64,
    pub column_count: usize,
}

/// Snapshot of an analysed source schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaAudit {
    pub generated_at: DateTime<Utc>,
    pub total_tables: usize,
    pub total_rows: i64,
    pub total_columns: usize,
    pub skipped_columns: usize,
    pub domains: BTreeMap<String, DomainSummary>,
    /// Tables scoring above the critical threshold, most important first.
    pub critical_tables: Vec<TableSummary>,
    pub relations: Vec<InferredRelation>,
}

impl SchemaAudit {
    /// Build the snapshot from annotated descriptors.
    pub fn build(tables: &[TableDescriptor]) -> Self {
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        let mut domains: BTreeMap<String, DomainSummary> = BTreeMap::new();
        let mut critical_tables = Vec::new();
        let mut relations = Vec::new();

        for t in tables {
            let entry = domains.entry(t.domain.to_string()).or_default();
            entry.table_count += 1;
            entry.row_count += t.estimated_row_count;
            entry.tables.push(t.name.clone());

            if t.importance > CRITICAL_IMPORTANCE {
                critical_tables.push(TableSummary {
                    name: t.name.clone(),
                    domain: t.domain,
                    importance: t.importance,
                    row_count: t.estimated_row_count,
                    column_count: t.columns.len() + t.skipped_columns.len(),
                });
            }

            relations.extend(infer_relations(t, &names));
        }

        for summary in domains.values_mut() {
            summary.tables.sort();
        }
        critical_tables.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then(b.row_count.cmp(&a.row_count))
                .then(a.name.cmp(&b.name))
        });

        Self {
            generated_at: Utc::now(),
            total_tables: tables.len(),
            total_rows: tables.iter().map(|t| t.estimated_row_count).sum(),
            total_columns: tables.iter().map(|t| t.columns.len()).sum(),
            skipped_columns: tables.iter().map(|t| t.skipped_columns.len()).sum(),
            domains,
            critical_tables,
            relations,
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
