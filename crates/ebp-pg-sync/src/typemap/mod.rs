//! Type mapping between MSSQL and PostgreSQL.
//!
//! [`map_type`] is a pure lookup from an MSSQL catalog type to the
//! PostgreSQL column type used for the mirror. [`TargetType::coerce`] then
//! converts every source value to the kind of that column before it is
//! bound into a batch statement.

use serde::{Deserialize, Serialize};

use crate::core::{SqlValue, ValueKind};
use crate::error::{Result, SyncError};

/// Largest length PostgreSQL accepts for `varchar(n)` / `char(n)`.
pub const PG_MAX_VARCHAR: i32 = 10_485_760;

/// A PostgreSQL column type with the value kind it stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetType {
    /// DDL text, e.g. `numeric(18,4)` or `varchar(50)`.
    pub ddl: String,
    /// Kind of values written to the column.
    pub kind: ValueKind,
}

impl TargetType {
    fn new(ddl: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            ddl: ddl.into(),
            kind,
        }
    }

    /// Base type name without length or precision, e.g. `varchar`.
    pub fn base_name(&self) -> &str {
        self.ddl.split('(').next().unwrap_or(&self.ddl).trim()
    }

    /// Convert a source value to this column's kind.
    ///
    /// Widening conversions are free; anything that could lose information
    /// (float into numeric, out-of-range narrowing) is rejected.
    pub fn coerce(&self, column: &str, value: SqlValue) -> Result<SqlValue> {
        let fail = |v: &SqlValue| SyncError::Conversion {
            column: column.to_string(),
            message: format!("cannot store {:?} value in {}", v.kind(), self.ddl),
        };

        if value.is_null() {
            return Ok(SqlValue::Null(self.kind));
        }

        let converted = match (self.kind, value) {
            (ValueKind::Bool, SqlValue::Bool(v)) => SqlValue::Bool(v),
            (ValueKind::I16, SqlValue::I16(v)) => SqlValue::I16(v),
            (ValueKind::I16, SqlValue::I32(v)) => {
                SqlValue::I16(i16::try_from(v).map_err(|_| fail(&SqlValue::I32(v)))?)
            }
            (ValueKind::I32, SqlValue::I16(v)) => SqlValue::I32(v.into()),
            (ValueKind::I32, SqlValue::I32(v)) => SqlValue::I32(v),
            (ValueKind::I32, SqlValue::I64(v)) => {
                SqlValue::I32(i32::try_from(v).map_err(|_| fail(&SqlValue::I64(v)))?)
            }
            (ValueKind::I64, SqlValue::I16(v)) => SqlValue::I64(v.into()),
            (ValueKind::I64, SqlValue::I32(v)) => SqlValue::I64(v.into()),
            (ValueKind::I64, SqlValue::I64(v)) => SqlValue::I64(v),
            (ValueKind::F32, SqlValue::F32(v)) => SqlValue::F32(v),
            (ValueKind::F64, SqlValue::F32(v)) => SqlValue::F64(v.into()),
            (ValueKind::F64, SqlValue::F64(v)) => SqlValue::F64(v),
            (ValueKind::Decimal, SqlValue::Decimal(v)) => SqlValue::Decimal(v),
            (ValueKind::Decimal, SqlValue::I16(v)) => SqlValue::Decimal(v.into()),
            (ValueKind::Decimal, SqlValue::I32(v)) => SqlValue::Decimal(v.into()),
            (ValueKind::Decimal, SqlValue::I64(v)) => SqlValue::Decimal(v.into()),
            // PostgreSQL text cannot hold NUL characters.
            (ValueKind::String, SqlValue::Text(v)) => {
                if v.contains('\0') {
                    SqlValue::Text(v.replace('\0', ""))
                } else {
                    SqlValue::Text(v)
                }
            }
            (ValueKind::String, SqlValue::Uuid(v)) => SqlValue::Text(v.to_string()),
            (ValueKind::Bytes, SqlValue::Bytes(v)) => SqlValue::Bytes(v),
            (ValueKind::Uuid, SqlValue::Uuid(v)) => SqlValue::Uuid(v),
            (ValueKind::Uuid, SqlValue::Text(v)) => match uuid::Uuid::parse_str(v.trim()) {
                Ok(id) => SqlValue::Uuid(id),
                Err(_) => return Err(fail(&SqlValue::Text(v))),
            },
            (ValueKind::DateTime, SqlValue::DateTime(v)) => SqlValue::DateTime(v),
            (ValueKind::DateTime, SqlValue::Date(v)) => SqlValue::DateTime(v.and_time(Default::default())),
            (ValueKind::DateTimeOffset, SqlValue::DateTimeOffset(v)) => SqlValue::DateTimeOffset(v),
            (ValueKind::Date, SqlValue::Date(v)) => SqlValue::Date(v),
            (ValueKind::Time, SqlValue::Time(v)) => SqlValue::Time(v),
            (_, other) => return Err(fail(&other)),
        };

        Ok(converted)
    }
}

fn unsupported(source_type: &str) -> SyncError {
    SyncError::UnsupportedType {
        column: String::new(),
        source_type: source_type.to_string(),
    }
}

/// Map an MSSQL data type to its PostgreSQL mirror type.
///
/// `max_length` is the catalog character length (`-1` for `(max)`).
/// Numeric precision and scale are preserved exactly.
pub fn map_type(source_type: &str, max_length: i32, precision: i32, scale: i32) -> Result<TargetType> {
    let mapped = match source_type.to_lowercase().as_str() {
        // Boolean
        "bit" => TargetType::new("boolean", ValueKind::Bool),

        // Integer types
        "tinyint" | "smallint" => TargetType::new("smallint", ValueKind::I16),
        "int" => TargetType::new("integer", ValueKind::I32),
        "bigint" => TargetType::new("bigint", ValueKind::I64),

        // Exact numerics
        "decimal" | "numeric" => {
            if precision > 0 {
                TargetType::new(format!("numeric({},{})", precision, scale), ValueKind::Decimal)
            } else {
                TargetType::new("numeric", ValueKind::Decimal)
            }
        }
        "money" => TargetType::new("numeric(19,4)", ValueKind::Decimal),
        "smallmoney" => TargetType::new("numeric(10,4)", ValueKind::Decimal),

        // Floating point
        "float" => TargetType::new("double precision", ValueKind::F64),
        "real" => TargetType::new("real", ValueKind::F32),

        // Strings
        "char" | "nchar" => {
            if max_length > 0 && max_length <= PG_MAX_VARCHAR {
                TargetType::new(format!("char({})", max_length), ValueKind::String)
            } else if max_length > PG_MAX_VARCHAR {
                TargetType::new("text", ValueKind::String)
            } else {
                TargetType::new("char(1)", ValueKind::String)
            }
        }
        "varchar" | "nvarchar" => {
            if max_length > 0 && max_length <= PG_MAX_VARCHAR {
                TargetType::new(format!("varchar({})", max_length), ValueKind::String)
            } else {
                TargetType::new("text", ValueKind::String)
            }
        }
        "text" | "ntext" => TargetType::new("text", ValueKind::String),
        "xml" => TargetType::new("xml", ValueKind::String),

        // Binary
        "binary" | "varbinary" | "image" => TargetType::new("bytea", ValueKind::Bytes),

        // Date/time
        "date" => TargetType::new("date", ValueKind::Date),
        "time" => TargetType::new("time", ValueKind::Time),
        "datetime" | "datetime2" | "smalldatetime" => {
            TargetType::new("timestamp", ValueKind::DateTime)
        }
        "datetimeoffset" => TargetType::new("timestamptz", ValueKind::DateTimeOffset),

        // GUID
        "uniqueidentifier" => TargetType::new("uuid", ValueKind::Uuid),

        // sql_variant, spatial, hierarchyid, rowversion and unknown types
        _ => return Err(unsupported(source_type)),
    };

    Ok(mapped)
}

/// Read a PostgreSQL `information_schema.columns` type back into a [`TargetType`].
///
/// Unknown types map to `text` so that diffing reports them as a mismatch
/// instead of failing introspection.
pub fn parse_pg_type(
    data_type: &str,
    char_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> TargetType {
    match data_type.to_lowercase().as_str() {
        "boolean" => TargetType::new("boolean", ValueKind::Bool),
        "smallint" => TargetType::new("smallint", ValueKind::I16),
        "integer" => TargetType::new("integer", ValueKind::I32),
        "bigint" => TargetType::new("bigint", ValueKind::I64),
        "numeric" => match (precision, scale) {
            (Some(p), Some(s)) if p > 0 => {
                TargetType::new(format!("numeric({},{})", p, s), ValueKind::Decimal)
            }
            _ => TargetType::new("numeric", ValueKind::Decimal),
        },
        "double precision" => TargetType::new("double precision", ValueKind::F64),
        "real" => TargetType::new("real", ValueKind::F32),
        "character" => TargetType::new(
            format!("char({})", char_length.unwrap_or(1)),
            ValueKind::String,
        ),
        "character varying" => match char_length {
            Some(n) => TargetType::new(format!("varchar({})", n), ValueKind::String),
            None => TargetType::new("varchar", ValueKind::String),
        },
        "text" => TargetType::new("text", ValueKind::String),
        "xml" => TargetType::new("xml", ValueKind::String),
        "bytea" => TargetType::new("bytea", ValueKind::Bytes),
        "date" => TargetType::new("date", ValueKind::Date),
        "time without time zone" => TargetType::new("time", ValueKind::Time),
        "timestamp without time zone" => TargetType::new("timestamp", ValueKind::DateTime),
        "timestamp with time zone" => TargetType::new("timestamptz", ValueKind::DateTimeOffset),
        "uuid" => TargetType::new("uuid", ValueKind::Uuid),
        other => TargetType::new(other, ValueKind::String),
    }
}
