//! Identifier validation and quoting for both engines.
//!
//! Identifiers cannot be bound as statement parameters, so every table and
//! column name that reaches dynamic SQL goes through these functions.

use crate::error::{Result, SyncError};

/// Maximum identifier length accepted from either catalog (SQL Server limit).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// PostgreSQL truncates identifiers to NAMEDATALEN - 1 bytes.
pub const PG_MAX_IDENTIFIER_BYTES: usize = 63;

/// Validate an identifier for security issues.
///
/// Rejects empty names, names containing NUL bytes and names longer than
/// the SQL Server limit.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::Configuration(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(SyncError::Configuration(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::Configuration(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Truncate a name the way PostgreSQL does, on a char boundary.
pub fn pg_truncate(name: &str) -> &str {
    if name.len() <= PG_MAX_IDENTIFIER_BYTES {
        return name;
    }
    let mut end = PG_MAX_IDENTIFIER_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Quote a PostgreSQL identifier, preserving case.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", pg_truncate(name).replace('"', "\"\"")))
}

/// Quote a SQL Server identifier with brackets.
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Schema-qualified PostgreSQL table name.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Schema-qualified SQL Server table name.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}
