//! Error types for the sync engine.
//!
//! The first five variants form the user-facing taxonomy. Their messages are
//! prefixed with the taxonomy name because they are copied verbatim into
//! per-table results.

use thiserror::Error;

/// Main error type for sync, verification and backup operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Unreachable or misconfigured connection. Fatal to the whole run.
    #[error("ConfigurationError: {0}")]
    Configuration(String),

    /// Target lacks columns required by an incremental sync.
    #[error("SchemaMismatchError: column missing in target ({table}: {})", .columns.join(", "))]
    SchemaMismatch { table: String, columns: Vec<String> },

    /// Column type with no PostgreSQL mapping. The column is skipped.
    #[error("UnsupportedTypeError: {column} has unmapped type '{source_type}'")]
    UnsupportedType { column: String, source_type: String },

    /// A batch could not be committed on the target.
    #[error("BatchWriteError: {table} after {rows_committed} rows: {message}")]
    BatchWrite {
        table: String,
        rows_committed: u64,
        message: String,
    },

    /// A table sync or a sample fetch exceeded its time budget.
    #[error("TimeoutError: {unit} exceeded {seconds}s")]
    Timeout { unit: String, seconds: u64 },

    /// Source database error.
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database error.
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A source value could not be converted to its target type.
    #[error("Conversion failed for {column}: {message}")]
    Conversion { column: String, message: String },

    /// Incremental sync needs a key to upsert on.
    #[error("Table {0} has no primary key - incremental sync requires a key")]
    NoPrimaryKey(String),

    /// Pre-sync snapshot failed. Fatal to the requested destructive sync.
    #[error("Backup failed: {0}")]
    Backup(String),

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled (SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a BatchWrite error, translating common PostgreSQL failures.
    pub fn batch_write(
        table: impl Into<String>,
        rows_committed: u64,
        cause: impl ToString,
    ) -> Self {
        SyncError::BatchWrite {
            table: table.into(),
            rows_committed,
            message: friendly_write_message(&cause.to_string()),
        }
    }

    /// Create a Timeout error for a named unit of work.
    pub fn timeout(unit: impl Into<String>, seconds: u64) -> Self {
        SyncError::Timeout {
            unit: unit.into(),
            seconds,
        }
    }

    /// Errors that abort an entire operation instead of a single table.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_) | SyncError::Backup(_) | SyncError::Yaml(_)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Configuration(_) | SyncError::Yaml(_) => 2,
            SyncError::Backup(_) => 3,
            SyncError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Append a hint to the PostgreSQL errors operators hit most often.
fn friendly_write_message(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let hint = if lower.contains("numeric field overflow") {
        Some("a numeric value exceeds the target column precision")
    } else if lower.contains("value too long") {
        Some("a string exceeds the target column length")
    } else if lower.contains("invalid input syntax") {
        Some("a value has an invalid format for the target type")
    } else if lower.contains("violates") && lower.contains("constraint") {
        Some("a row violates a target constraint")
    } else {
        None
    };

    match hint {
        Some(h) => format!("{} ({})", raw, h),
        None => raw.to_string(),
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
