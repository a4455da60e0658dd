//! Owned SQL values flowing between the two engines.
//!
//! Values are produced by the source reader already converted to the kind of
//! their target column, so the PostgreSQL encoder can write them without
//! consulting the column type again.

use std::error::Error as StdError;

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use uuid::Uuid;

/// Logical kind of a target column.
///
/// Doubles as the type hint for NULL values so a NULL keeps the shape of
/// its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Decimal,
    String,
    Bytes,
    Uuid,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(ValueKind),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

/// One row, positional in descriptor column order.
pub type Row = Vec<SqlValue>;

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// The kind this value belongs to.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            SqlValue::Null(k) => *k,
            SqlValue::Bool(_) => ValueKind::Bool,
            SqlValue::I16(_) => ValueKind::I16,
            SqlValue::I32(_) => ValueKind::I32,
            SqlValue::I64(_) => ValueKind::I64,
            SqlValue::F32(_) => ValueKind::F32,
            SqlValue::F64(_) => ValueKind::F64,
            SqlValue::Decimal(_) => ValueKind::Decimal,
            SqlValue::Text(_) => ValueKind::String,
            SqlValue::Bytes(_) => ValueKind::Bytes,
            SqlValue::Uuid(_) => ValueKind::Uuid,
            SqlValue::DateTime(_) => ValueKind::DateTime,
            SqlValue::DateTimeOffset(_) => ValueKind::DateTimeOffset,
            SqlValue::Date(_) => ValueKind::Date,
            SqlValue::Time(_) => ValueKind::Time,
        }
    }

    /// Canonical text used to identify key values across engines.
    ///
    /// UUIDs are lower-cased so an MSSQL `uniqueidentifier` and a
    /// PostgreSQL `uuid` render identically.
    pub fn key_text(&self) -> String {
        match self {
            SqlValue::Null(_) => "NULL".to_string(),
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Decimal(v) => v.normalize().to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Bytes(v) => hex::encode(v),
            SqlValue::Uuid(v) => v.hyphenated().to_string(),
            SqlValue::DateTime(v) => v.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            SqlValue::DateTimeOffset(v) => v.to_rfc3339(),
            SqlValue::Date(v) => v.to_string(),
            SqlValue::Time(v) => v.to_string(),
        }
    }

    /// JSON rendering for reports. Decimals stay strings to keep every digit.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null(_) => JsonValue::Null,
            SqlValue::Bool(v) => JsonValue::Bool(*v),
            SqlValue::I16(v) => JsonValue::from(*v),
            SqlValue::I32(v) => JsonValue::from(*v),
            SqlValue::I64(v) => JsonValue::from(*v),
            SqlValue::F32(v) => JsonValue::from(*v as f64),
            SqlValue::F64(v) => JsonValue::from(*v),
            SqlValue::Bytes(v) => JsonValue::String(format!("\\x{}", hex::encode(v))),
            other => JsonValue::String(other.key_text()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlValue::Null(_) => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::I16(v) => v.to_sql(ty, out),
            SqlValue::I32(v) => v.to_sql(ty, out),
            SqlValue::I64(v) => v.to_sql(ty, out),
            SqlValue::F32(v) => v.to_sql(ty, out),
            SqlValue::F64(v) => v.to_sql(ty, out),
            SqlValue::Decimal(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.as_str().to_sql(ty, out),
            SqlValue::Bytes(v) => v.as_slice().to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::DateTime(v) => v.to_sql(ty, out),
            SqlValue::DateTimeOffset(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::Time(v) => v.to_sql(ty, out),
        }
    }

    // Values are coerced to their column kind before binding.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}
