//! SQL text builders for the PostgreSQL mirror.
//!
//! Values are always bound as parameters; only identifiers are spliced in,
//! and those go through [`quote_pg`].

use crate::catalog::{ColumnDescriptor, TableDescriptor};
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::error::Result;

/// PostgreSQL bind parameter limit per statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// How many rows of `width` columns fit in one statement.
pub fn rows_per_statement(width: usize) -> usize {
    (MAX_BIND_PARAMS / width.max(1)).max(1)
}

/// Whether a `rows`-row statement is worth keeping in the connection's
/// statement cache. Only full chunks repeat from batch to batch; tail
/// chunks are prepared and dropped.
pub fn reuses_statement(rows: usize, width: usize, batch_size: usize) -> bool {
    rows == rows_per_statement(width).min(batch_size.max(1))
}

fn column_list(columns: &[ColumnDescriptor]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_pg(&c.name))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

/// `CREATE TABLE` with case-preserving names and the key as primary key.
pub fn create_table(schema: &str, table: &TableDescriptor, if_not_exists: bool) -> Result<String> {
    let mut ddl = format!(
        "CREATE TABLE {}{} (\n",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        qualify_pg(schema, &table.name)?
    );

    let mut lines = Vec::with_capacity(table.columns.len() + 1);
    for col in &table.columns {
        let nullable = if col.nullable && !col.is_primary_key {
            ""
        } else {
            " NOT NULL"
        };
        lines.push(format!(
            "    {} {}{}",
            quote_pg(&col.name)?,
            col.target_type.ddl,
            nullable
        ));
    }

    let keys = table.key_columns();
    if !keys.is_empty() {
        let key_list = keys
            .iter()
            .map(|c| quote_pg(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        lines.push(format!("    PRIMARY KEY ({})", key_list));
    }

    ddl.push_str(&lines.join(",\n"));
    ddl.push_str("\n)");
    Ok(ddl)
}

pub fn drop_table(schema: &str, table: &str) -> Result<String> {
    Ok(format!("DROP TABLE IF EXISTS {} CASCADE", qualify_pg(schema, table)?))
}

pub fn truncate_table(schema: &str, table: &str) -> Result<String> {
    Ok(format!("TRUNCATE TABLE {}", qualify_pg(schema, table)?))
}

pub fn count_rows(schema: &str, table: &str) -> Result<String> {
    Ok(format!("SELECT COUNT(*) FROM {}", qualify_pg(schema, table)?))
}

/// Placeholder groups `($1, $2), ($3, $4), ...` for `rows` rows of `width`.
fn placeholder_rows(rows: usize, width: usize) -> String {
    (0..rows)
        .map(|r| {
            let cells = (0..width)
                .map(|c| format!("${}", r * width + c + 1))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", cells)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Multi-row parameterized `INSERT`.
pub fn insert(schema: &str, table: &TableDescriptor, rows: usize) -> Result<String> {
    Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualify_pg(schema, &table.name)?,
        column_list(&table.columns)?,
        placeholder_rows(rows, table.columns.len())
    ))
}

/// Multi-row parameterized upsert where the source row always wins.
///
/// Rows whose values already match are left alone so unchanged rows do not
/// produce dead tuples.
pub fn upsert(schema: &str, table: &TableDescriptor, rows: usize) -> Result<String> {
    let qualified = qualify_pg(schema, &table.name)?;
    let keys = table
        .key_columns()
        .iter()
        .map(|c| quote_pg(&c.name))
        .collect::<Result<Vec<_>>>()?;
    let others = table
        .columns
        .iter()
        .filter(|c| !c.is_primary_key)
        .map(|c| quote_pg(&c.name))
        .collect::<Result<Vec<_>>>()?;

    let mut sql = format!(
        "INSERT INTO {} AS t ({}) VALUES {} ON CONFLICT ({}) ",
        qualified,
        column_list(&table.columns)?,
        placeholder_rows(rows, table.columns.len()),
        keys.join(", ")
    );

    if others.is_empty() {
        sql.push_str("DO NOTHING");
    } else {
        let set = others
            .iter()
            .map(|c| format!("{} = EXCLUDED.{}", c, c))
            .collect::<Vec<_>>()
            .join(", ");
        let current = others
            .iter()
            .map(|c| format!("t.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let incoming = others
            .iter()
            .map(|c| format!("EXCLUDED.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            "DO UPDATE SET {} WHERE ROW({}) IS DISTINCT FROM ROW({})",
            set, current, incoming
        ));
    }

    Ok(sql)
}

/// Select expression for a column read back for comparison.
fn select_expr(col: &ColumnDescriptor) -> Result<String> {
    let quoted = quote_pg(&col.name)?;
    // xml has no binary FromSql; read it as text.
    if col.target_type.base_name() == "xml" {
        Ok(format!("{}::text", quoted))
    } else {
        Ok(quoted)
    }
}

/// `SELECT` of all descriptor columns for `key_rows` keys.
pub fn select_by_keys(schema: &str, table: &TableDescriptor, key_rows: usize) -> Result<String> {
    let keys = table.key_columns();
    let select = table
        .columns
        .iter()
        .map(select_expr)
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let predicate = if keys.len() == 1 {
        let params = (1..=key_rows)
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} IN ({})", quote_pg(&keys[0].name)?, params)
    } else {
        let key_list = keys
            .iter()
            .map(|c| quote_pg(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        format!("({}) IN ({})", key_list, placeholder_rows(key_rows, keys.len()))
    };

    Ok(format!(
        "SELECT {} FROM {} WHERE {}",
        select,
        qualify_pg(schema, &table.name)?,
        predicate
    ))
}
