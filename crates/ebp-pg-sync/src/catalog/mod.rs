//! Schema catalog: table descriptors for both engines and their diff.
//!
//! Descriptors are rebuilt at the start of every operation. Column order is
//! the catalog ordinal order and never changes within one run, which lets
//! batches carry rows positionally.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::advisor::BusinessDomain;
use crate::core::identifier::pg_truncate;
use crate::error::SyncError;
use crate::typemap::{self, TargetType};

/// Link from a column to another table.
///
/// Inferred links come from naming conventions and are advisory only; they
/// are never turned into constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relation {
    /// Guessed from a `<Name>Id` column.
    Inferred {
        candidate_table: String,
        /// Whether the candidate exists in the catalog.
        resolved: bool,
    },
    /// Declared foreign key in the source catalog.
    Declared {
        referenced_table: String,
        referenced_column: String,
    },
}

impl Relation {
    /// Name of the table this relation points at.
    pub fn target_table(&self) -> &str {
        match self {
            Relation::Inferred { candidate_table, .. } => candidate_table,
            Relation::Declared {
                referenced_table, ..
            } => referenced_table,
        }
    }

    /// Whether the referenced table is known to exist.
    pub fn is_resolved(&self) -> bool {
        match self {
            Relation::Inferred { resolved, .. } => *resolved,
            Relation::Declared { .. } => true,
        }
    }
}

/// One column of a table as seen by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Type as reported by the catalog it came from.
    pub source_type: String,
    /// PostgreSQL type the column is mirrored to.
    pub target_type: TargetType,
    pub nullable: bool,
    /// Character length, `-1` for `(max)`, 0 when not applicable.
    pub max_length: i32,
    pub precision: i32,
    pub scale: i32,
    /// Best-effort key flag: declared PK, or the `Id`/`UniqueId` convention.
    pub is_primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
}

/// A column left out of the mirror, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedColumn {
    pub name: String,
    pub source_type: String,
    pub reason: String,
}

/// A table with its ordered, mirrorable columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub skipped_columns: Vec<SkippedColumn>,
    pub estimated_row_count: i64,
    #[serde(default)]
    pub domain: BusinessDomain,
    #[serde(default)]
    pub importance: u32,
}

impl TableDescriptor {
    /// Get the full table name (schema.table).
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Name the table gets in PostgreSQL.
    pub fn target_name(&self) -> &str {
        pg_truncate(&self.name)
    }

    /// Key columns in column order.
    pub fn key_columns(&self) -> Vec<&ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_primary_key).collect()
    }

    /// Check if the table has a usable key.
    pub fn has_key(&self) -> bool {
        self.columns.iter().any(|c| c.is_primary_key)
    }

    /// Positions of the key columns within a row.
    pub fn key_indexes(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    /// Look up a column by name, case-sensitively.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Raw column metadata as read from a source catalog.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub data_type: String,
    pub max_length: i32,
    pub precision: i32,
    pub scale: i32,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub foreign_key: Option<(String, String)>,
}

impl RawColumn {
    /// Shorthand used by catalog readers and tests.
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length: 0,
            precision: 0,
            scale: 0,
            is_nullable: true,
            is_primary_key: false,
            foreign_key: None,
        }
    }
}

/// Build a source descriptor, mapping every column through the type mapper.
///
/// Columns with unmapped types are recorded in `skipped_columns` and left
/// out. When the catalog declares no primary key, a column named `Id` or
/// `UniqueId` becomes the key.
pub fn build_source_descriptor(
    schema: &str,
    name: &str,
    raw_columns: Vec<RawColumn>,
    estimated_row_count: i64,
) -> TableDescriptor {
    let mut columns = Vec::with_capacity(raw_columns.len());
    let mut skipped_columns = Vec::new();

    for raw in raw_columns {
        match typemap::map_type(&raw.data_type, raw.max_length, raw.precision, raw.scale) {
            Ok(target_type) => columns.push(ColumnDescriptor {
                relation: raw.foreign_key.map(|(table, column)| Relation::Declared {
                    referenced_table: table,
                    referenced_column: column,
                }),
                name: raw.name,
                source_type: raw.data_type,
                target_type,
                nullable: raw.is_nullable,
                max_length: raw.max_length,
                precision: raw.precision,
                scale: raw.scale,
                is_primary_key: raw.is_primary_key,
            }),
            Err(SyncError::UnsupportedType { source_type, .. }) => {
                warn!(
                    table = name,
                    column = %raw.name,
                    source_type = %source_type,
                    "Skipping column with unsupported type"
                );
                skipped_columns.push(SkippedColumn {
                    name: raw.name,
                    source_type,
                    reason: "unsupported type".to_string(),
                });
            }
            Err(e) => {
                skipped_columns.push(SkippedColumn {
                    name: raw.name,
                    source_type: raw.data_type,
                    reason: e.to_string(),
                });
            }
        }
    }

    if !columns.iter().any(|c| c.is_primary_key) {
        let conventional = ["id", "uniqueid"]
            .iter()
            .find_map(|k| columns.iter().position(|c| c.name.eq_ignore_ascii_case(k)));
        if let Some(idx) = conventional {
            columns[idx].is_primary_key = true;
        }
    }

    TableDescriptor {
        schema: schema.to_string(),
        name: name.to_string(),
        columns,
        skipped_columns,
        estimated_row_count,
        domain: BusinessDomain::default(),
        importance: 0,
    }
}

/// A column whose mirrored type differs from the target's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMismatch {
    pub column: String,
    pub expected: String,
    pub actual: String,
}

/// Differences between a source table and its mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub table: String,
    pub missing_table: bool,
    /// Present in the source, absent from the target.
    pub missing_columns: Vec<String>,
    /// Present in the target only.
    pub extra_columns: Vec<String>,
    pub type_mismatches: Vec<TypeMismatch>,
}

impl SchemaDiff {
    /// No differences at all.
    pub fn is_empty(&self) -> bool {
        !self.missing_table
            && self.missing_columns.is_empty()
            && self.extra_columns.is_empty()
            && self.type_mismatches.is_empty()
    }

    /// An incremental write would produce a partial row shape.
    pub fn blocks_incremental(&self) -> bool {
        !self.missing_columns.is_empty()
    }

    /// Convert a blocking diff into the matching error.
    pub fn into_error(self) -> SyncError {
        SyncError::SchemaMismatch {
            table: self.table,
            columns: self.missing_columns,
        }
    }
}

/// Compare one source descriptor with its target counterpart.
pub fn diff_table(source: &TableDescriptor, target: Option<&TableDescriptor>) -> SchemaDiff {
    let mut diff = SchemaDiff {
        table: source.name.clone(),
        ..Default::default()
    };

    let target = match target {
        Some(t) => t,
        None => {
            diff.missing_table = true;
            return diff;
        }
    };

    let target_cols: HashMap<&str, &ColumnDescriptor> =
        target.columns.iter().map(|c| (c.name.as_str(), c)).collect();

    for col in &source.columns {
        match target_cols.get(pg_truncate(&col.name)) {
            None => diff.missing_columns.push(col.name.clone()),
            Some(t) if t.target_type.ddl != col.target_type.ddl => {
                diff.type_mismatches.push(TypeMismatch {
                    column: col.name.clone(),
                    expected: col.target_type.ddl.clone(),
                    actual: t.target_type.ddl.clone(),
                });
            }
            Some(_) => {}
        }
    }

    for col in &target.columns {
        let known = source
            .columns
            .iter()
            .any(|s| pg_truncate(&s.name) == col.name);
        if !known {
            diff.extra_columns.push(col.name.clone());
        }
    }

    diff
}

/// Diff every source table against the target catalog.
pub fn diff(source: &[TableDescriptor], target: &[TableDescriptor]) -> Vec<SchemaDiff> {
    let by_name: HashMap<&str, &TableDescriptor> =
        target.iter().map(|t| (t.name.as_str(), t)).collect();
    source
        .iter()
        .map(|s| diff_table(s, by_name.get(s.target_name()).copied()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typemap::parse_pg_type;

    fn raw(name: &str, ty: &str, len: i32) -> RawColumn {
        RawColumn {
            max_length: len,
            ..RawColumn::new(name, ty)
        }
    }

    fn customer() -> TableDescriptor {
        build_source_descriptor(
            "dbo",
            "Customer",
            vec![
                raw("Id", "uniqueidentifier", 0),
                raw("Name", "nvarchar", 100),
                raw("Location", "geography", 0),
                raw("Notes", "nvarchar", -1),
            ],
            42,
        )
    }

    fn target_of(source: &TableDescriptor, drop: &[&str]) -> TableDescriptor {
        let mut t = source.clone();
        t.columns.retain(|c| !drop.contains(&c.name.as_str()));
        t
    }

    #[test]
    fn test_unsupported_column_is_skipped() {
        let t = customer();
        let names: Vec<_> = t.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Id", "Name", "Notes"]);
        assert_eq!(t.skipped_columns.len(), 1);
        assert_eq!(t.skipped_columns[0].name, "Location");
    }

    #[test]
    fn test_conventional_key_detection() {
        let t = customer();
        assert!(t.column("Id").unwrap().is_primary_key);
        assert_eq!(t.key_indexes(), vec![0]);

        let t = build_source_descriptor(
            "dbo",
            "Log",
            vec![raw("UniqueId", "uniqueidentifier", 0), raw("Text", "text", 0)],
            0,
        );
        assert!(t.has_key());
        assert_eq!(t.key_columns()[0].name, "UniqueId");
    }

    #[test]
    fn test_declared_key_wins_over_convention() {
        let mut code = raw("Code", "varchar", 20);
        code.is_primary_key = true;
        let t = build_source_descriptor("dbo", "Item", vec![raw("Id", "int", 0), code], 0);
        assert_eq!(t.key_columns().len(), 1);
        assert_eq!(t.key_columns()[0].name, "Code");
    }

    #[test]
    fn test_declared_foreign_key_becomes_relation() {
        let mut fk = raw("CustomerId", "uniqueidentifier", 0);
        fk.foreign_key = Some(("Customer".into(), "Id".into()));
        let t = build_source_descriptor("dbo", "SaleDocument", vec![fk], 0);
        assert_eq!(
            t.columns[0].relation,
            Some(Relation::Declared {
                referenced_table: "Customer".into(),
                referenced_column: "Id".into()
            })
        );
    }

    #[test]
    fn test_diff_reports_missing_and_extra_columns() {
        let source = customer();
        let mut target = target_of(&source, &["Notes"]);
        target.columns.push(ColumnDescriptor {
            name: "Legacy".into(),
            source_type: "text".into(),
            target_type: parse_pg_type("text", None, None, None),
            nullable: true,
            max_length: 0,
            precision: 0,
            scale: 0,
            is_primary_key: false,
            relation: None,
        });

        let d = diff_table(&source, Some(&target));
        assert_eq!(d.missing_columns, vec!["Notes".to_string()]);
        assert_eq!(d.extra_columns, vec!["Legacy".to_string()]);
        assert!(d.blocks_incremental());
        assert!(d
            .into_error()
            .to_string()
            .starts_with("SchemaMismatchError: column missing in target"));
    }

    #[test]
    fn test_diff_reports_type_mismatch() {
        let source = customer();
        let mut target = source.clone();
        target.columns[1].target_type = parse_pg_type("character varying", Some(50), None, None);
        let d = diff_table(&source, Some(&target));
        assert_eq!(d.type_mismatches.len(), 1);
        assert_eq!(d.type_mismatches[0].expected, "varchar(100)");
        assert_eq!(d.type_mismatches[0].actual, "varchar(50)");
        assert!(!d.blocks_incremental());
    }

    #[test]
    fn test_diff_missing_table_and_clean_match() {
        let source = customer();
        let diffs = diff(&[source.clone()], &[]);
        assert!(diffs[0].missing_table);
        let diffs = diff(&[source.clone()], &[source]);
        assert!(diffs[0].is_empty());
    }

    #[test]
    fn test_long_names_compare_truncated() {
        let long = format!("Col{}", "x".repeat(70));
        let source = build_source_descriptor("dbo", "T", vec![raw(&long, "int", 0)], 0);
        let mut target = source.clone();
        target.columns[0].name = pg_truncate(&long).to_string();
        assert!(diff_table(&source, Some(&target)).is_empty());
    }
}
