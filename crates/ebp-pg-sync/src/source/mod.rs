//! MSSQL source: the ERP database being mirrored.
//!
//! Uses Tiberius with a bb8 connection pool. Reads are plain SELECTs
//! streamed row by row from the TDS connection and cut into batches, so a
//! table is never loaded in memory as a whole.

pub mod query;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use futures::{Stream, TryStreamExt};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row as TdsRow};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::catalog::{build_source_descriptor, RawColumn, TableDescriptor};
use crate::config::SourceConfig;
use crate::core::{Row, SourceDatabase, SqlValue, ValueKind};
use crate::error::{Result, SyncError};

/// Maximum TDS packet size (32767 bytes, ~32KB).
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection acquisition timeout from pool (30 seconds).
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection timeout (5 minutes).
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum connection lifetime (30 minutes).
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// TCP keepalive interval (30 seconds).
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Batches buffered between the reader task and the writer.
const STREAM_BUFFER: usize = 16;

/// Pooled Tiberius client.
///
/// `abandoned` is set when a result set was left unread; bb8 then discards
/// the connection instead of handing the pending rows to the next borrower.
struct MssqlConnection {
    client: Client<Compat<TcpStream>>,
    abandoned: bool,
}

impl Deref for MssqlConnection {
    type Target = Client<Compat<TcpStream>>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl DerefMut for MssqlConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }
}

fn io_error(e: std::io::Error, context: &str) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: format!("{}: {}", context, e),
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlConnection;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| io_error(e, "connecting to MSSQL"))?;
        tcp.set_nodelay(true).ok();

        // Long batches leave the socket idle on our side; keep it alive.
        let std_tcp = tcp
            .into_std()
            .map_err(|e| io_error(e, "configuring MSSQL socket"))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }

        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(|e| io_error(e, "converting socket"))?;

        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(MssqlConnection {
            client,
            abandoned: false,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.abandoned
    }
}

/// MSSQL source backed by a bb8 pool.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
    schema: String,
}

impl MssqlSource {
    /// Create a pool with `max_size` connections and test one of them.
    pub async fn new(config: &SourceConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager {
            config: config.clone(),
        };
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| SyncError::pool(e, "creating MSSQL connection pool"))?;

        let source = Self {
            pool,
            schema: config.schema.clone(),
        };
        source.ping().await?;

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );

        Ok(source)
    }

    async fn client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "getting MSSQL connection from pool"))
    }

    /// Run a catalog query bound to the configured schema.
    async fn catalog_rows(&self, sql: &str) -> Result<Vec<TdsRow>> {
        let mut client = self.client().await?;
        let mut query = Query::new(sql);
        query.bind(self.schema.as_str());
        let rows = query
            .query(&mut client.client)
            .await?
            .into_first_result()
            .await?;
        Ok(rows)
    }
}

fn text(row: &TdsRow, idx: usize) -> Result<String> {
    Ok(row.try_get::<&str, _>(idx)?.unwrap_or_default().to_string())
}

fn int(row: &TdsRow, idx: usize) -> Result<i32> {
    Ok(row.try_get::<i32, _>(idx)?.unwrap_or(0))
}

/// Read one column of a TDS row according to its source type.
fn read_value(row: &TdsRow, idx: usize, source_type: &str, kind: ValueKind) -> Result<SqlValue> {
    let value = match source_type.to_lowercase().as_str() {
        "bit" => row.try_get::<bool, _>(idx)?.map(SqlValue::Bool),
        "tinyint" => row.try_get::<u8, _>(idx)?.map(|v| SqlValue::I16(v.into())),
        "smallint" => row.try_get::<i16, _>(idx)?.map(SqlValue::I16),
        "int" => row.try_get::<i32, _>(idx)?.map(SqlValue::I32),
        "bigint" => row.try_get::<i64, _>(idx)?.map(SqlValue::I64),
        "real" => row.try_get::<f32, _>(idx)?.map(SqlValue::F32),
        "float" => row.try_get::<f64, _>(idx)?.map(SqlValue::F64),
        "decimal" | "numeric" | "money" | "smallmoney" => {
            match row.try_get::<tiberius::numeric::Numeric, _>(idx)? {
                Some(n) => Some(SqlValue::Decimal(
                    rust_decimal::Decimal::try_from_i128_with_scale(n.value(), n.scale().into())
                        .map_err(|e| SyncError::Conversion {
                            column: format!("#{}", idx),
                            message: format!("decimal {} out of range: {}", n, e),
                        })?,
                )),
                None => None,
            }
        }
        "uniqueidentifier" => row.try_get::<uuid::Uuid, _>(idx)?.map(SqlValue::Uuid),
        "date" => row
            .try_get::<chrono::NaiveDate, _>(idx)?
            .map(SqlValue::Date),
        "time" => row
            .try_get::<chrono::NaiveTime, _>(idx)?
            .map(SqlValue::Time),
        "datetime" | "datetime2" | "smalldatetime" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)?
            .map(SqlValue::DateTime),
        "datetimeoffset" => row
            .try_get::<chrono::DateTime<chrono::FixedOffset>, _>(idx)?
            .map(SqlValue::DateTimeOffset),
        "binary" | "varbinary" | "image" => row
            .try_get::<&[u8], _>(idx)?
            .map(|v| SqlValue::Bytes(v.to_vec())),
        _ => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::Text(s.to_string())),
    };
    Ok(value.unwrap_or(SqlValue::Null(kind)))
}

fn read_row(row: &TdsRow, table: &TableDescriptor) -> Result<Row> {
    table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            read_value(row, idx, &col.source_type, col.target_type.kind).map_err(|e| match e {
                SyncError::Conversion { message, .. } => SyncError::Conversion {
                    column: col.name.clone(),
                    message,
                },
                other => other,
            })
        })
        .collect()
}

async fn stream_table(
    pool: Pool<TiberiusConnectionManager>,
    table: TableDescriptor,
    batch_size: usize,
    tx: mpsc::Sender<Result<Vec<Row>>>,
) -> Result<()> {
    let mut conn = pool
        .get_owned()
        .await
        .map_err(|e| SyncError::pool(e, "getting MSSQL connection for stream"))?;

    let sql = query::select_all(&table)?;
    let outcome = {
        let rows = conn.simple_query(sql).await?.into_row_stream();
        send_batches(rows, batch_size, &tx, |row| read_row(row, &table)).await
    };

    match outcome {
        Ok(Streamed::Drained(total)) => {
            debug!("{}: streamed {} rows", table.full_name(), total);
            Ok(())
        }
        Ok(Streamed::Abandoned(total)) => {
            debug!(
                "{}: reader stopped after {} rows, receiver closed",
                table.full_name(),
                total
            );
            conn.abandoned = true;
            Ok(())
        }
        Err(e) => {
            conn.abandoned = true;
            Err(e)
        }
    }
}

/// How a result set ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Streamed {
    /// Every row was read. Holds the row count.
    Drained(u64),
    /// The receiver went away first. Holds the rows sent.
    Abandoned(u64),
}

/// Group `rows` into batches of `batch_size` and send them on `tx`.
async fn send_batches<T, E, S, F>(
    mut rows: S,
    batch_size: usize,
    tx: &mpsc::Sender<Result<Vec<Row>>>,
    convert: F,
) -> Result<Streamed>
where
    S: Stream<Item = std::result::Result<T, E>> + Unpin,
    SyncError: From<E>,
    F: Fn(&T) -> Result<Row>,
{
    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut total = 0u64;

    while let Some(row) = rows.try_next().await? {
        batch.push(convert(&row)?);
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            let len = full.len() as u64;
            if tx.send(Ok(full)).await.is_err() {
                return Ok(Streamed::Abandoned(total));
            }
            total += len;
        }
    }

    if !batch.is_empty() {
        total += batch.len() as u64;
        let _ = tx.send(Ok(batch)).await;
    }
    Ok(Streamed::Drained(total))
}

#[async_trait]
impl SourceDatabase for MssqlSource {
    async fn introspect(&self) -> Result<Vec<TableDescriptor>> {
        let mut raw: HashMap<String, Vec<RawColumn>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for row in self.catalog_rows(query::COLUMNS).await? {
            let table = text(&row, 0)?;
            let column = RawColumn {
                name: text(&row, 1)?,
                data_type: text(&row, 2)?,
                max_length: int(&row, 3)?,
                precision: int(&row, 4)?,
                scale: int(&row, 5)?,
                is_nullable: int(&row, 6)? == 1,
                is_primary_key: false,
                foreign_key: None,
            };
            if !raw.contains_key(&table) {
                order.push(table.clone());
            }
            raw.entry(table).or_default().push(column);
        }

        for row in self.catalog_rows(query::PRIMARY_KEYS).await? {
            let (table, column) = (text(&row, 0)?, text(&row, 1)?);
            if let Some(col) = raw
                .get_mut(&table)
                .and_then(|cols| cols.iter_mut().find(|c| c.name == column))
            {
                col.is_primary_key = true;
            }
        }

        for row in self.catalog_rows(query::FOREIGN_KEYS).await? {
            let (table, column) = (text(&row, 0)?, text(&row, 1)?);
            let reference = (text(&row, 2)?, text(&row, 3)?);
            if let Some(col) = raw
                .get_mut(&table)
                .and_then(|cols| cols.iter_mut().find(|c| c.name == column))
            {
                col.foreign_key = Some(reference);
            }
        }

        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in self.catalog_rows(query::ROW_COUNTS).await? {
            counts.insert(text(&row, 0)?, row.try_get::<i64, _>(1)?.unwrap_or(0));
        }

        let tables: Vec<TableDescriptor> = order
            .into_iter()
            .filter_map(|name| {
                let columns = raw.remove(&name)?;
                let rows = counts.get(&name).copied().unwrap_or(0);
                Some(build_source_descriptor(&self.schema, &name, columns, rows))
            })
            .collect();

        info!("Introspected {} source tables in [{}]", tables.len(), self.schema);
        Ok(tables)
    }

    async fn count_rows(&self, table: &TableDescriptor) -> Result<i64> {
        let mut client = self.client().await?;
        let row = client
            .simple_query(query::count_rows(table)?)
            .await?
            .into_row()
            .await?;
        Ok(row
            .map(|r| r.try_get::<i64, _>(0))
            .transpose()?
            .flatten()
            .unwrap_or(0))
    }

    fn stream_rows(
        &self,
        table: &TableDescriptor,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Vec<Row>>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let pool = self.pool.clone();
        let table = table.clone();

        tokio::spawn(async move {
            if let Err(e) = stream_table(pool, table, batch_size.max(1), tx.clone()).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn sample_rows(
        &self,
        table: &TableDescriptor,
        sample_size: usize,
        seed: u64,
    ) -> Result<Vec<Row>> {
        if !table.has_key() {
            return Err(SyncError::NoPrimaryKey(table.name.clone()));
        }

        let mut client = self.client().await?;
        let rows = client
            .simple_query(query::sample(table, sample_size, seed)?)
            .await?
            .into_first_result()
            .await?;

        rows.iter().map(|r| read_row(r, table)).collect()
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }
}
