//! T-SQL text for reading the ERP database.

use crate::catalog::{ColumnDescriptor, TableDescriptor};
use crate::core::identifier::{qualify_mssql, quote_mssql};
use crate::error::Result;

/// Select expression for one column.
///
/// Money is read as an exact decimal and xml as text so the reader never has
/// to decode either wire type.
fn select_expr(col: &ColumnDescriptor) -> Result<String> {
    let quoted = quote_mssql(&col.name)?;
    let expr = match col.source_type.to_lowercase().as_str() {
        "money" => format!("CAST({q} AS DECIMAL(19,4)) AS {q}", q = quoted),
        "smallmoney" => format!("CAST({q} AS DECIMAL(10,4)) AS {q}", q = quoted),
        "xml" => format!("CAST({q} AS NVARCHAR(MAX)) AS {q}", q = quoted),
        _ => quoted,
    };
    Ok(expr)
}

fn select_list(table: &TableDescriptor) -> Result<String> {
    Ok(table
        .columns
        .iter()
        .map(select_expr)
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn key_order(table: &TableDescriptor) -> Result<Option<String>> {
    let keys = table.key_columns();
    if keys.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        keys.iter()
            .map(|c| quote_mssql(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", "),
    ))
}

/// Full table read in key order when a key exists.
pub fn select_all(table: &TableDescriptor) -> Result<String> {
    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list(table)?,
        qualify_mssql(&table.schema, &table.name)?
    );
    if let Some(order) = key_order(table)? {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }
    Ok(sql)
}

pub fn count_rows(table: &TableDescriptor) -> Result<String> {
    Ok(format!(
        "SELECT COUNT_BIG(*) FROM {}",
        qualify_mssql(&table.schema, &table.name)?
    ))
}

/// Seeded sample: rows ordered by a hash of the seed and the key text.
///
/// The order depends only on the key values and the seed, so an unchanged
/// table always yields the same sample for the same seed.
pub fn sample(table: &TableDescriptor, sample_size: usize, seed: u64) -> Result<String> {
    let key_parts = table
        .key_columns()
        .iter()
        .map(|c| Ok(format!("CONVERT(NVARCHAR(400), {})", quote_mssql(&c.name)?)))
        .collect::<Result<Vec<_>>>()?
        .join(", N'|', ");

    Ok(format!(
        "SELECT TOP ({n}) {cols} FROM {table} \
         ORDER BY HASHBYTES('SHA2_256', CONCAT(N'{seed}|', {keys}))",
        n = sample_size,
        cols = select_list(table)?,
        table = qualify_mssql(&table.schema, &table.name)?,
        seed = seed,
        keys = key_parts,
    ))
}

pub const COLUMNS: &str = r#"
    SELECT
        c.TABLE_NAME,
        c.COLUMN_NAME,
        c.DATA_TYPE,
        CAST(ISNULL(c.CHARACTER_MAXIMUM_LENGTH, 0) AS INT),
        CAST(ISNULL(c.NUMERIC_PRECISION, 0) AS INT),
        CAST(ISNULL(c.NUMERIC_SCALE, 0) AS INT),
        CASE WHEN c.IS_NULLABLE = 'YES' THEN 1 ELSE 0 END
    FROM INFORMATION_SCHEMA.COLUMNS c
    JOIN INFORMATION_SCHEMA.TABLES t
        ON t.TABLE_SCHEMA = c.TABLE_SCHEMA
        AND t.TABLE_NAME = c.TABLE_NAME
        AND t.TABLE_TYPE = 'BASE TABLE'
    WHERE c.TABLE_SCHEMA = @P1
    ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
"#;

pub const PRIMARY_KEYS: &str = r#"
    SELECT c.TABLE_NAME, c.COLUMN_NAME
    FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
    JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
        ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
        AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
        AND c.TABLE_NAME = tc.TABLE_NAME
    WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
      AND tc.TABLE_SCHEMA = @P1
"#;

pub const FOREIGN_KEYS: &str = r#"
    SELECT tp.name, cp.name, tr.name, cr.name
    FROM sys.foreign_key_columns fkc
    JOIN sys.tables tp ON fkc.parent_object_id = tp.object_id
    JOIN sys.schemas s ON tp.schema_id = s.schema_id
    JOIN sys.columns cp
        ON fkc.parent_object_id = cp.object_id
        AND fkc.parent_column_id = cp.column_id
    JOIN sys.tables tr ON fkc.referenced_object_id = tr.object_id
    JOIN sys.columns cr
        ON fkc.referenced_object_id = cr.object_id
        AND fkc.referenced_column_id = cr.column_id
    WHERE s.name = @P1
"#;

/// Approximate row counts from sys.partitions.
pub const ROW_COUNTS: &str = r#"
    SELECT t.name, CAST(SUM(p.rows) AS BIGINT)
    FROM sys.partitions p
    JOIN sys.tables t ON p.object_id = t.object_id
    JOIN sys.schemas s ON t.schema_id = s.schema_id
    WHERE s.name = @P1 AND p.index_id IN (0, 1)
    GROUP BY t.name
"#;
