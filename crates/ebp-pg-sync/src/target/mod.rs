//! PostgreSQL mirror: pooled connections, DDL and batched writes.

pub mod sql;
mod tls;

pub use tls::SslMode;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::catalog::{ColumnDescriptor, TableDescriptor};
use crate::config::TargetConfig;
use crate::core::identifier::pg_truncate;
use crate::core::{Row, SqlValue, TargetDatabase, ValueKind};
use crate::error::{Result, SyncError};
use crate::typemap::parse_pg_type;

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_BATCH_SIZE: usize = 1_000;

/// PostgreSQL target backed by a deadpool connection pool.
pub struct PgTarget {
    pool: Pool,
    schema: String,
    batch_size: usize,
}

impl PgTarget {
    /// Create a pool and test one connection.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("ebp-pg-sync");

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match SslMode::parse(&config.ssl_mode)?.connector()? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| SyncError::pool(e, "creating PostgreSQL target pool"))?
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| SyncError::pool(e, "creating PostgreSQL target pool"))?
            }
        };

        let target = Self {
            pool,
            schema: config.schema.clone(),
            batch_size: DEFAULT_BATCH_SIZE,
        };
        target.ping().await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_conns
        );

        Ok(target)
    }

    /// Rows per batch the sync executor sends; sizes the statement cache.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "getting PostgreSQL connection from pool"))
    }

    async fn ensure_schema(&self, client: &deadpool_postgres::Object) -> Result<()> {
        let stmt = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            crate::core::identifier::quote_pg(&self.schema)?
        );
        client.batch_execute(&stmt).await?;
        Ok(())
    }

    /// Write `rows` with `build` statements sized under the bind limit, in one
    /// transaction.
    async fn write_rows(
        &self,
        table: &TableDescriptor,
        rows: &[Row],
        build: fn(&str, &TableDescriptor, usize) -> Result<String>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let width = table.columns.len();
        let mut written = 0u64;

        for chunk in rows.chunks(sql::rows_per_statement(width)) {
            let text = build(&self.schema, table, chunk.len())?;
            let stmt = if sql::reuses_statement(chunk.len(), width, self.batch_size) {
                tx.prepare_cached(&text).await?
            } else {
                tx.prepare(&text).await?
            };
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();
            tx.execute(&stmt, &params).await?;
            written += chunk.len() as u64;
        }

        tx.commit().await?;
        Ok(written)
    }
}

/// Read one PostgreSQL column as the given kind.
fn read_value(row: &tokio_postgres::Row, idx: usize, kind: ValueKind) -> Result<SqlValue> {
    let value = match kind {
        ValueKind::Bool => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        ValueKind::I16 => row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::I16),
        ValueKind::I32 => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32),
        ValueKind::I64 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        ValueKind::F32 => row.try_get::<_, Option<f32>>(idx)?.map(SqlValue::F32),
        ValueKind::F64 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        ValueKind::Decimal => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(SqlValue::Decimal),
        ValueKind::String => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
        ValueKind::Bytes => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        ValueKind::Uuid => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(SqlValue::Uuid),
        ValueKind::DateTime => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(SqlValue::DateTime),
        ValueKind::DateTimeOffset => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)?
            .map(SqlValue::DateTimeOffset),
        ValueKind::Date => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(SqlValue::Date),
        ValueKind::Time => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map(SqlValue::Time),
    };
    Ok(value.unwrap_or(SqlValue::Null(kind)))
}

#[async_trait]
impl TargetDatabase for PgTarget {
    async fn introspect(&self) -> Result<Vec<TableDescriptor>> {
        let client = self.client().await?;

        let query = r#"
            SELECT
                c.table_name::text,
                c.column_name::text,
                c.data_type::text,
                c.character_maximum_length::int,
                c.numeric_precision::int,
                c.numeric_scale::int,
                c.is_nullable = 'YES',
                EXISTS (
                    SELECT 1
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage k
                      ON tc.constraint_name = k.constraint_name
                     AND tc.table_schema = k.table_schema
                     AND tc.table_name = k.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                      AND tc.table_schema = c.table_schema
                      AND tc.table_name = c.table_name
                      AND k.column_name = c.column_name
                ),
                COALESCE((
                    SELECT GREATEST(cl.reltuples, 0)::bigint
                    FROM pg_class cl
                    JOIN pg_namespace n ON n.oid = cl.relnamespace
                    WHERE n.nspname = c.table_schema AND cl.relname = c.table_name
                ), 0)
            FROM information_schema.columns c
            JOIN information_schema.tables t
              ON t.table_schema = c.table_schema
             AND t.table_name = c.table_name
             AND t.table_type = 'BASE TABLE'
            WHERE c.table_schema = $1
            ORDER BY c.table_name, c.ordinal_position
        "#;

        let rows = client.query(query, &[&self.schema]).await?;
        let mut tables: BTreeMap<String, TableDescriptor> = BTreeMap::new();

        for row in rows {
            let table_name: String = row.try_get(0)?;
            let data_type: String = row.try_get(2)?;
            let char_len: Option<i32> = row.try_get(3)?;
            let precision: Option<i32> = row.try_get(4)?;
            let scale: Option<i32> = row.try_get(5)?;

            let column = ColumnDescriptor {
                name: row.try_get(1)?,
                target_type: parse_pg_type(&data_type, char_len, precision, scale),
                source_type: data_type,
                nullable: row.try_get(6)?,
                max_length: char_len.unwrap_or(0),
                precision: precision.unwrap_or(0),
                scale: scale.unwrap_or(0),
                is_primary_key: row.try_get(7)?,
                relation: None,
            };

            let estimated: i64 = row.try_get(8)?;
            tables
                .entry(table_name.clone())
                .or_insert_with(|| TableDescriptor {
                    schema: self.schema.clone(),
                    name: table_name,
                    columns: Vec::new(),
                    skipped_columns: Vec::new(),
                    estimated_row_count: estimated,
                    domain: Default::default(),
                    importance: 0,
                })
                .columns
                .push(column);
        }

        debug!("Introspected {} target tables", tables.len());
        Ok(tables.into_values().collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
                &[&self.schema, &pg_truncate(table)],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn recreate_table(&self, table: &TableDescriptor) -> Result<()> {
        let mut client = self.client().await?;
        self.ensure_schema(&client).await?;

        let tx = client.transaction().await?;
        tx.batch_execute(&sql::drop_table(&self.schema, &table.name)?)
            .await?;
        tx.batch_execute(&sql::create_table(&self.schema, table, false)?)
            .await?;
        tx.commit().await?;

        debug!("Recreated {}.{}", self.schema, table.target_name());
        Ok(())
    }

    async fn create_table(&self, table: &TableDescriptor) -> Result<()> {
        let client = self.client().await?;
        self.ensure_schema(&client).await?;
        client
            .batch_execute(&sql::create_table(&self.schema, table, true)?)
            .await?;
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(&sql::truncate_table(&self.schema, table)?)
            .await?;
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        let client = self.client().await?;
        let row = client
            .query_one(&sql::count_rows(&self.schema, table)?, &[])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn insert_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        self.write_rows(table, rows, sql::insert).await
    }

    async fn upsert_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        if !table.has_key() {
            return Err(SyncError::NoPrimaryKey(table.name.clone()));
        }
        self.write_rows(table, rows, sql::upsert).await
    }

    async fn fetch_by_keys(
        &self,
        table: &TableDescriptor,
        keys: &[Vec<SqlValue>],
    ) -> Result<Vec<Row>> {
        if !table.has_key() {
            return Err(SyncError::NoPrimaryKey(table.name.clone()));
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.client().await?;
        let key_width = table.key_columns().len();
        let mut out = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(sql::rows_per_statement(key_width)) {
            let query = sql::select_by_keys(&self.schema, table, chunk.len())?;
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|key| key.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();

            for row in client.query(&query, &params).await? {
                let values = table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| read_value(&row, idx, col.target_type.kind))
                    .collect::<Result<Row>>()?;
                out.push(values);
            }
        }

        Ok(out)
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}
