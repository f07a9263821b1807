//! In-memory warehouse and file-sink fakes for engine integration
//! tests. The warehouse keeps a committed store plus per-transaction
//! staged tables and an op log, so rollback, tmp-table isolation, and
//! the out-of-tx partition delete behave like a real destination.

// Each integration test binary compiles this module and uses a subset.
#![allow(dead_code)]

use anyhow::{Context, Result};
use std::sync::Once;
use async_trait::async_trait;
use bulkstream_engine::{
    BulkError, DeletePredicate, FileAdapter, LoadSource, SqlAdapter, TxAdapter, WarehouseState,
};
use bulkstream_types::{
    sanitize_identifier, DataKind, FileCompression, FileFormat, Object, Table, TableDiff,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

static TRACING: Once = Once::new();

/// Route engine logs through the test output once per binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, Default)]
pub struct StoredTable {
    pub schema: Table,
    pub rows: Vec<Object>,
}

#[derive(Default)]
struct Store {
    tables: BTreeMap<String, StoredTable>,
    fail_load_table: bool,
}

/// Committed-state warehouse fake.
pub struct MockWarehouse {
    store: Arc<Mutex<Store>>,
}

impl MockWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(Mutex::new(Store::default())),
        })
    }

    /// Make every subsequent `load_table` fail.
    pub fn fail_load_table(&self, fail: bool) {
        self.store.lock().unwrap().fail_load_table = fail;
    }

    pub fn seed_table(&self, schema: Table, rows: Vec<Object>) {
        let mut store = self.store.lock().unwrap();
        store
            .tables
            .insert(schema.name.clone(), StoredTable { schema, rows });
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.store
            .lock()
            .unwrap()
            .tables
            .get(name)
            .map_or(0, |t| t.rows.len())
    }

    pub fn rows(&self, name: &str) -> Vec<Object> {
        self.store
            .lock()
            .unwrap()
            .tables
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn schema(&self, name: &str) -> Option<Table> {
        self.store
            .lock()
            .unwrap()
            .tables
            .get(name)
            .map(|t| t.schema.clone())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.store.lock().unwrap().tables.keys().cloned().collect()
    }
}

fn pk_key(row: &Object, pks: &[String]) -> String {
    pks.iter()
        .map(|pk| row.get(pk).map(ToString::to_string).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}

/// Coerce row values to the declared column kinds, the way a real
/// warehouse load does after a column widened to text.
fn coerce_row(schema: &Table, mut row: Object) -> Object {
    for (name, column) in &schema.columns {
        if column.kind != DataKind::String {
            continue;
        }
        if let Some(value) = row.get_mut(name) {
            match value {
                Value::Number(n) => *value = Value::String(n.to_string()),
                Value::Bool(b) => *value = Value::String(b.to_string()),
                _ => {}
            }
        }
    }
    row
}

fn apply_rows(target: &mut StoredTable, rows: Vec<Object>, merge: bool, pks: &[String]) {
    let schema = target.schema.clone();
    for row in rows {
        let row = coerce_row(&schema, row);
        if merge && !pks.is_empty() {
            let key = pk_key(&row, pks);
            if let Some(pos) = target.rows.iter().position(|r| pk_key(r, pks) == key) {
                target.rows[pos] = row;
                continue;
            }
        }
        target.rows.push(row);
    }
}

fn load_ndjson(path: &Path) -> Result<Vec<Object>> {
    let text = std::fs::read_to_string(path).context("read batch file")?;
    text.lines()
        .map(|line| serde_json::from_str::<Object>(line).context("parse ndjson line"))
        .collect()
}

#[async_trait]
impl SqlAdapter for MockWarehouse {
    fn type_name(&self) -> &str {
        "mock"
    }

    fn column_name(&self, raw: &str) -> String {
        sanitize_identifier(raw)
    }

    fn batch_file_format(&self) -> FileFormat {
        FileFormat::Ndjson
    }

    fn batch_file_compression(&self) -> FileCompression {
        FileCompression::None
    }

    async fn get_table_schema(&self, name: &str) -> Result<Table, BulkError> {
        let store = self.store.lock().unwrap();
        Ok(store
            .tables
            .get(name)
            .map(|t| t.schema.clone())
            .unwrap_or_else(|| Table::new(name)))
    }

    async fn create_table(&self, table: &Table) -> Result<(), BulkError> {
        let mut store = self.store.lock().unwrap();
        store
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| StoredTable {
                schema: table.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn patch_table_schema(&self, table: &Table, diff: &TableDiff) -> Result<(), BulkError> {
        let mut store = self.store.lock().unwrap();
        let stored = store
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| BulkError::load("patch", format!("no such table {}", table.name)))?;
        stored.schema.apply_diff(diff);
        Ok(())
    }

    async fn insert(&self, table: &Table, merge: bool, object: &Object) -> Result<(), BulkError> {
        let mut store = self.store.lock().unwrap();
        let stored = store
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| BulkError::load("insert", format!("no such table {}", table.name)))?;
        apply_rows(stored, vec![object.clone()], merge, &table.primary_keys);
        Ok(())
    }

    async fn delete(&self, table: &str, predicate: &DeletePredicate) -> Result<(), BulkError> {
        let mut store = self.store.lock().unwrap();
        let stored = store
            .tables
            .get_mut(table)
            .ok_or_else(|| BulkError::load("delete", format!("no such table {table}")))?;
        stored
            .rows
            .retain(|row| row.get(&predicate.column) != Some(&predicate.value));
        Ok(())
    }

    async fn drop_table(&self, table: &Table, if_exists: bool) -> Result<(), BulkError> {
        let mut store = self.store.lock().unwrap();
        if store.tables.remove(&table.name).is_none() && !if_exists {
            return Err(BulkError::load(
                "drop",
                format!("no such table {}", table.name),
            ));
        }
        Ok(())
    }

    async fn open_tx(&self) -> Result<Box<dyn TxAdapter>, BulkError> {
        Ok(Box::new(MockTx {
            store: Arc::clone(&self.store),
            staged: BTreeMap::new(),
            ops: Vec::new(),
            state: TxState::Open,
        }))
    }
}

#[derive(PartialEq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

enum TxOp {
    InsertRows {
        dst: String,
        rows: Vec<Object>,
        merge: bool,
        pks: Vec<String>,
    },
    Replace {
        dst: String,
        table: StoredTable,
    },
}

/// Transaction fake: tmp tables live in `staged`; effects on the
/// committed store queue in `ops` until commit.
struct MockTx {
    store: Arc<Mutex<Store>>,
    staged: BTreeMap<String, StoredTable>,
    ops: Vec<TxOp>,
    state: TxState,
}

impl MockTx {
    fn check_open(&self) -> Result<(), BulkError> {
        if self.state == TxState::Open {
            Ok(())
        } else {
            Err(BulkError::load("tx", "transaction is closed"))
        }
    }

    fn staged_rows(&self, name: &str) -> Vec<Object> {
        self.staged
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_else(|| {
                self.store
                    .lock()
                    .unwrap()
                    .tables
                    .get(name)
                    .map(|t| t.rows.clone())
                    .unwrap_or_default()
            })
    }
}

#[async_trait]
impl TxAdapter for MockTx {
    async fn get_table_schema(&mut self, name: &str) -> Result<Table, BulkError> {
        self.check_open()?;
        if let Some(staged) = self.staged.get(name) {
            return Ok(staged.schema.clone());
        }
        let store = self.store.lock().unwrap();
        Ok(store
            .tables
            .get(name)
            .map(|t| t.schema.clone())
            .unwrap_or_else(|| Table::new(name)))
    }

    async fn create_table(&mut self, table: &Table) -> Result<(), BulkError> {
        self.check_open()?;
        self.staged
            .entry(table.name.clone())
            .or_insert_with(|| StoredTable {
                schema: table.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn patch_table_schema(
        &mut self,
        table: &Table,
        diff: &TableDiff,
    ) -> Result<(), BulkError> {
        self.check_open()?;
        let staged = self
            .staged
            .get_mut(&table.name)
            .ok_or_else(|| BulkError::load("patch", format!("no such table {}", table.name)))?;
        staged.schema.apply_diff(diff);
        Ok(())
    }

    async fn load_table(
        &mut self,
        table: &Table,
        source: &LoadSource,
    ) -> Result<WarehouseState, BulkError> {
        self.check_open()?;
        if self.store.lock().unwrap().fail_load_table {
            return Err(BulkError::load("load_table", "injected load failure"));
        }
        let rows = match source {
            LoadSource::Local { path, format } => {
                if *format != FileFormat::Ndjson {
                    return Err(BulkError::load(
                        "load_table",
                        format!("mock warehouse loads ndjson only, got {format}"),
                    ));
                }
                load_ndjson(path).map_err(|e| BulkError::load("load_table", e))?
            }
            LoadSource::S3 { .. } => {
                return Err(BulkError::load("load_table", "mock warehouse has no s3"));
            }
        };
        let count = rows.len() as u64;
        let staged = self
            .staged
            .get_mut(&table.name)
            .ok_or_else(|| BulkError::load("load_table", format!("no such table {}", table.name)))?;
        staged.rows.extend(rows);
        Ok(WarehouseState {
            name: "mock_load".into(),
            rows: count,
            bytes: 0,
            time_processed_ms: 1,
        })
    }

    async fn copy_tables(
        &mut self,
        dst: &Table,
        src: &Table,
        merge: bool,
    ) -> Result<WarehouseState, BulkError> {
        self.check_open()?;
        let rows = self.staged_rows(&src.name);
        let count = rows.len() as u64;
        self.ops.push(TxOp::InsertRows {
            dst: dst.name.clone(),
            rows,
            merge,
            pks: dst.primary_keys.clone(),
        });
        Ok(WarehouseState {
            name: "mock_copy".into(),
            rows: count,
            bytes: 0,
            time_processed_ms: 1,
        })
    }

    async fn replace_table(&mut self, dst_name: &str, src: &Table) -> Result<(), BulkError> {
        self.check_open()?;
        let mut table = self
            .staged
            .remove(&src.name)
            .ok_or_else(|| BulkError::load("replace", format!("no such table {}", src.name)))?;
        table.schema.name = dst_name.to_string();
        table.schema.temporary = false;
        self.ops.push(TxOp::Replace {
            dst: dst_name.to_string(),
            table,
        });
        Ok(())
    }

    async fn insert(
        &mut self,
        table: &Table,
        merge: bool,
        object: &Object,
    ) -> Result<(), BulkError> {
        self.check_open()?;
        let staged = self
            .staged
            .get_mut(&table.name)
            .ok_or_else(|| BulkError::load("insert", format!("no such table {}", table.name)))?;
        apply_rows(staged, vec![object.clone()], merge, &table.primary_keys);
        Ok(())
    }

    async fn drop_table(&mut self, table: &Table, if_exists: bool) -> Result<(), BulkError> {
        self.check_open()?;
        if self.staged.remove(&table.name).is_none() && !if_exists {
            return Err(BulkError::load(
                "drop",
                format!("no such table {}", table.name),
            ));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BulkError> {
        if self.state != TxState::Open {
            return Ok(());
        }
        let mut store = self.store.lock().unwrap();
        for op in self.ops.drain(..) {
            match op {
                TxOp::InsertRows {
                    dst,
                    rows,
                    merge,
                    pks,
                } => {
                    let stored = store.tables.entry(dst.clone()).or_default();
                    apply_rows(stored, rows, merge, &pks);
                }
                TxOp::Replace { dst, table } => {
                    store.tables.insert(dst, table);
                }
            }
        }
        self.staged.clear();
        self.state = TxState::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BulkError> {
        if self.state == TxState::Committed {
            return Ok(());
        }
        self.ops.clear();
        self.staged.clear();
        self.state = TxState::RolledBack;
        Ok(())
    }
}

/// Object-storage sink fake capturing uploaded bytes.
pub struct MockFileSink {
    format: FileFormat,
    compression: FileCompression,
    uploads: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockFileSink {
    pub fn new(format: FileFormat) -> Arc<Self> {
        Arc::new(Self {
            format,
            compression: FileCompression::None,
            uploads: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn uploaded(&self, name: &str) -> Option<Vec<u8>> {
        self.uploads.lock().unwrap().get(name).cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl FileAdapter for MockFileSink {
    fn format(&self) -> FileFormat {
        self.format
    }

    fn compression(&self) -> FileCompression {
        self.compression
    }

    async fn upload(&self, name: &str, local_path: &Path) -> Result<(), BulkError> {
        let contents = std::fs::read(local_path)
            .map_err(|e| BulkError::staging("failed to read upload source", e))?;
        self.uploads
            .lock()
            .unwrap()
            .insert(name.to_string(), contents);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BulkError> {
        self.uploads.lock().unwrap().remove(name);
        Ok(())
    }
}
