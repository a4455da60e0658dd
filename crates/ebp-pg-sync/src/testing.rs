//! In-memory databases for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::catalog::{build_source_descriptor, RawColumn, TableDescriptor};
use crate::core::identifier::pg_truncate;
use crate::core::{Row, SourceDatabase, SqlValue, TargetDatabase, ValueKind};
use crate::error::{Result, SyncError};
use crate::verify::row_key;

/// `Customer` with a uuid key, text, nullable text, decimal and timestamp.
pub fn customer_table() -> TableDescriptor {
    build_source_descriptor(
        "dbo",
        "Customer",
        vec![
            RawColumn {
                is_nullable: false,
                ..RawColumn::new("Id", "uniqueidentifier")
            },
            RawColumn {
                max_length: 100,
                ..RawColumn::new("Name", "nvarchar")
            },
            RawColumn {
                max_length: -1,
                ..RawColumn::new("Notes", "nvarchar")
            },
            RawColumn {
                precision: 18,
                scale: 4,
                ..RawColumn::new("Balance", "decimal")
            },
            RawColumn::new("CreatedAt", "datetime2"),
        ],
        0,
    )
}

pub fn customer_rows(n: usize) -> Vec<Row> {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    (0..n)
        .map(|i| {
            vec![
                SqlValue::Uuid(Uuid::from_u128(i as u128 + 1)),
                SqlValue::Text(format!("Customer {}", i)),
                if i % 3 == 0 {
                    SqlValue::Null(ValueKind::String)
                } else {
                    SqlValue::Text(format!("note {}", i))
                },
                SqlValue::Decimal(Decimal::new(i as i64 * 125, 2)),
                SqlValue::DateTime(base + chrono::Duration::seconds(i as i64)),
            ]
        })
        .collect()
}

/// Table with an int `Id` key and one text column.
pub fn simple_table(name: &str) -> TableDescriptor {
    build_source_descriptor(
        "dbo",
        name,
        vec![
            RawColumn {
                is_nullable: false,
                ..RawColumn::new("Id", "int")
            },
            RawColumn {
                max_length: 50,
                ..RawColumn::new("Label", "nvarchar")
            },
        ],
        0,
    )
}

pub fn simple_rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| vec![SqlValue::I32(i as i32 + 1), SqlValue::Text(format!("row {}", i))])
        .collect()
}

fn simulated(message: &str) -> SyncError {
    SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
}

#[derive(Default)]
pub struct MemorySource {
    tables: Vec<(TableDescriptor, Vec<Row>)>,
    stalled: HashSet<String>,
    unreachable: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, mut table: TableDescriptor, rows: Vec<Row>) -> Self {
        table.estimated_row_count = rows.len() as i64;
        self.tables.push((table, rows));
        self
    }

    /// Streams for this table never produce a batch.
    pub fn stall(mut self, table: &str) -> Self {
        self.stalled.insert(table.to_string());
        self
    }

    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    fn find(&self, name: &str) -> Result<&(TableDescriptor, Vec<Row>)> {
        self.tables
            .iter()
            .find(|(t, _)| t.name == name)
            .ok_or_else(|| simulated("no such source table"))
    }
}

#[async_trait]
impl SourceDatabase for MemorySource {
    async fn introspect(&self) -> Result<Vec<TableDescriptor>> {
        Ok(self.tables.iter().map(|(t, _)| t.clone()).collect())
    }

    async fn count_rows(&self, table: &TableDescriptor) -> Result<i64> {
        Ok(self.find(&table.name)?.1.len() as i64)
    }

    fn stream_rows(
        &self,
        table: &TableDescriptor,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Vec<Row>>> {
        let (tx, rx) = mpsc::channel(4);
        let stalled = self.stalled.contains(&table.name);
        let rows = self.find(&table.name).map(|(_, rows)| rows.clone());

        tokio::spawn(async move {
            if stalled {
                let _keep = tx;
                std::future::pending::<()>().await;
                return;
            }
            match rows {
                Ok(rows) => {
                    for chunk in rows.chunks(batch_size) {
                        if tx.send(Ok(chunk.to_vec())).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
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
        let (_, rows) = self.find(&table.name)?;
        let mut ranked: Vec<(Vec<u8>, &Row)> = rows
            .iter()
            .map(|row| {
                let mut hasher = Sha256::new();
                hasher.update(format!("{}|{}", seed, row_key(table, row)).as_bytes());
                (hasher.finalize().to_vec(), row)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ranked
            .into_iter()
            .take(sample_size)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(simulated("connection refused"));
        }
        Ok(())
    }
}

struct MemTable {
    descriptor: TableDescriptor,
    rows: Vec<Row>,
    batches: usize,
}

#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, MemTable>>,
    fail_after: HashMap<String, usize>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes to `table` fail once `batches` batches have been committed.
    pub fn fail_writes_after(mut self, table: &str, batches: usize) -> Self {
        self.fail_after.insert(table.to_string(), batches);
        self
    }

    /// Put a table with rows in place, replacing any existing one.
    pub fn install(&self, descriptor: TableDescriptor, rows: Vec<Row>) {
        self.tables.lock().unwrap().insert(
            pg_truncate(&descriptor.name).to_string(),
            MemTable {
                descriptor,
                rows,
                batches: 0,
            },
        );
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn batches_written(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.batches)
            .unwrap_or(0)
    }

    pub fn descriptor(&self, table: &str) -> Option<TableDescriptor> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.descriptor.clone())
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Overwrite one stored value.
    pub fn set_value(&self, table: &str, row: usize, column: usize, value: SqlValue) {
        let mut tables = self.tables.lock().unwrap();
        tables.get_mut(table).unwrap().rows[row][column] = value;
    }

    pub fn remove_row(&self, table: &str, row: usize) {
        let mut tables = self.tables.lock().unwrap();
        tables.get_mut(table).unwrap().rows.remove(row);
    }

    fn write(&self, table: &TableDescriptor, rows: &[Row], upsert: bool) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mem = tables
            .get_mut(table.target_name())
            .ok_or_else(|| simulated("relation does not exist"))?;

        if let Some(limit) = self.fail_after.get(&table.name) {
            if mem.batches >= *limit {
                return Err(simulated(
                    "duplicate key value violates unique constraint (simulated)",
                ));
            }
        }

        let mut index: HashMap<String, usize> = mem
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (row_key(table, r), i))
            .collect();

        for row in rows {
            let key = row_key(table, row);
            match index.get(&key).copied() {
                Some(i) if upsert => mem.rows[i] = row.clone(),
                Some(_) if table.has_key() => {
                    return Err(simulated("duplicate key value violates unique constraint"))
                }
                _ => {
                    index.insert(key, mem.rows.len());
                    mem.rows.push(row.clone());
                }
            }
        }

        mem.batches += 1;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl TargetDatabase for MemoryTarget {
    async fn introspect(&self) -> Result<Vec<TableDescriptor>> {
        let tables = self.tables.lock().unwrap();
        let mut out: Vec<_> = tables.values().map(|t| t.descriptor.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.lock().unwrap().contains_key(pg_truncate(table)))
    }

    async fn recreate_table(&self, table: &TableDescriptor) -> Result<()> {
        self.install(table.clone(), Vec::new());
        Ok(())
    }

    async fn create_table(&self, table: &TableDescriptor) -> Result<()> {
        if !self.table_exists(&table.name).await? {
            self.install(table.clone(), Vec::new());
        }
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let mem = tables
            .get_mut(pg_truncate(table))
            .ok_or_else(|| simulated("relation does not exist"))?;
        mem.rows.clear();
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        let tables = self.tables.lock().unwrap();
        let mem = tables
            .get(pg_truncate(table))
            .ok_or_else(|| simulated("relation does not exist"))?;
        Ok(mem.rows.len() as i64)
    }

    async fn insert_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        self.write(table, rows, false)
    }

    async fn upsert_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        if !table.has_key() {
            return Err(SyncError::NoPrimaryKey(table.name.clone()));
        }
        self.write(table, rows, true)
    }

    async fn fetch_by_keys(
        &self,
        table: &TableDescriptor,
        keys: &[Vec<SqlValue>],
    ) -> Result<Vec<Row>> {
        let wanted: HashSet<String> = keys
            .iter()
            .map(|k| k.iter().map(SqlValue::key_text).collect::<Vec<_>>().join("|"))
            .collect();
        let tables = self.tables.lock().unwrap();
        let mem = tables
            .get(table.target_name())
            .ok_or_else(|| simulated("relation does not exist"))?;
        Ok(mem
            .rows
            .iter()
            .filter(|r| wanted.contains(&row_key(table, r)))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
