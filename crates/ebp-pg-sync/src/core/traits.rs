//! Seams between the engine and the two databases.
//!
//! - [`SourceDatabase`]: catalog, counts, batched streaming and seeded samples
//!   from the ERP database
//! - [`TargetDatabase`]: catalog, DDL and batched writes on the PostgreSQL
//!   mirror
//!
//! The sync executor, verifier and repairer only see these traits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::catalog::TableDescriptor;
use crate::core::value::{Row, SqlValue};
use crate::error::Result;

/// Read schema and data from the source database.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Describe every base table of the configured schema.
    async fn introspect(&self) -> Result<Vec<TableDescriptor>>;

    /// Exact row count.
    async fn count_rows(&self, table: &TableDescriptor) -> Result<i64>;

    /// Stream the descriptor's columns in batches of `batch_size` rows.
    ///
    /// Rows are read through a server-side cursor and pushed into a bounded
    /// channel, so a table is never held in memory as a whole. Values come
    /// in descriptor column order, still in their source representation.
    fn stream_rows(&self, table: &TableDescriptor, batch_size: usize)
        -> mpsc::Receiver<Result<Vec<Row>>>;

    /// Draw up to `sample_size` rows, reproducibly for a given seed.
    ///
    /// Requires a key. The same table state and seed yield the same rows.
    async fn sample_rows(
        &self,
        table: &TableDescriptor,
        sample_size: usize,
        seed: u64,
    ) -> Result<Vec<Row>>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;
}

/// Write schema and data to the PostgreSQL mirror.
#[async_trait]
pub trait TargetDatabase: Send + Sync {
    /// Describe every table of the target schema.
    async fn introspect(&self) -> Result<Vec<TableDescriptor>>;

    /// Check if a table exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Drop and create a table in a single committed transaction.
    async fn recreate_table(&self, table: &TableDescriptor) -> Result<()>;

    /// Create a table if it does not exist.
    async fn create_table(&self, table: &TableDescriptor) -> Result<()>;

    /// Remove all rows from a table.
    async fn truncate_table(&self, table: &str) -> Result<()>;

    /// Exact row count.
    async fn count_rows(&self, table: &str) -> Result<i64>;

    /// Insert a batch in its own transaction. Returns rows written.
    async fn insert_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<u64>;

    /// Upsert a batch on the descriptor key in its own transaction.
    ///
    /// Source values overwrite target values on conflict.
    async fn upsert_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<u64>;

    /// Fetch rows whose key matches one of `keys`, in descriptor column order.
    async fn fetch_by_keys(&self, table: &TableDescriptor, keys: &[Vec<SqlValue>])
        -> Result<Vec<Row>>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;
}
