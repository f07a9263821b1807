//! Destination capability contracts.
//!
//! The engine never speaks a SQL dialect or an object-store protocol
//! itself. Warehouses implement [`SqlAdapter`] (session-scoped,
//! autocommit) and [`TxAdapter`] (bound to one native transaction);
//! file sinks implement [`FileAdapter`]. Errors from adapters surface
//! verbatim in decorated engine errors and always trigger rollback on
//! transactional paths.

use crate::error::BulkError;
use crate::s3::S3StageConfig;
use crate::state::WarehouseState;
use async_trait::async_trait;
use bulkstream_types::{FileCompression, FileFormat, Object, Table, TableDiff};
use serde_json::Value;
use std::path::PathBuf;

/// Where a flushed batch file lives when the warehouse loads it.
#[derive(Debug, Clone)]
pub enum LoadSource {
    /// Batch file on local disk.
    Local { path: PathBuf, format: FileFormat },
    /// Batch file staged in S3.
    S3 {
        key: String,
        format: FileFormat,
        config: S3StageConfig,
    },
}

impl LoadSource {
    pub fn format(&self) -> FileFormat {
        match self {
            Self::Local { format, .. } | Self::S3 { format, .. } => *format,
        }
    }
}

/// Row predicate for [`SqlAdapter::delete`]: `column = value`.
#[derive(Debug, Clone)]
pub struct DeletePredicate {
    pub column: String,
    pub value: Value,
}

/// Warehouse capability consumed by the engine, outside any transaction.
#[async_trait]
pub trait SqlAdapter: Send + Sync {
    /// Short destination kind for logs ("postgres", "snowflake", ...).
    fn type_name(&self) -> &str;

    /// Map a raw event key to this dialect's column naming.
    fn column_name(&self, raw: &str) -> String;

    /// Format the destination bulk-loads fastest.
    fn batch_file_format(&self) -> FileFormat;

    fn batch_file_compression(&self) -> FileCompression;

    /// Avro schema JSON for a table; only consulted when
    /// [`Self::batch_file_format`] is Avro.
    fn avro_schema(&self, _table: &Table) -> Option<Value> {
        None
    }

    /// Fetch the current schema. A missing table is reported as a
    /// descriptor with no columns (`Table::exists() == false`), not an
    /// error.
    async fn get_table_schema(&self, name: &str) -> Result<Table, BulkError>;

    async fn create_table(&self, table: &Table) -> Result<(), BulkError>;

    /// Apply additive schema changes (add + widen); never drops.
    async fn patch_table_schema(&self, table: &Table, diff: &TableDiff) -> Result<(), BulkError>;

    /// Insert one row with autocommit; `merge` upserts by the table's
    /// primary keys.
    async fn insert(&self, table: &Table, merge: bool, object: &Object) -> Result<(), BulkError>;

    /// Delete rows matching the predicate, autocommit.
    async fn delete(&self, table: &str, predicate: &DeletePredicate) -> Result<(), BulkError>;

    async fn drop_table(&self, table: &Table, if_exists: bool) -> Result<(), BulkError>;

    async fn open_tx(&self) -> Result<Box<dyn TxAdapter>, BulkError>;
}

/// Warehouse capability bound to one open transaction.
///
/// `commit` and `rollback` are idempotent; `rollback` after `commit`
/// is a no-op.
#[async_trait]
pub trait TxAdapter: Send {
    async fn get_table_schema(&mut self, name: &str) -> Result<Table, BulkError>;

    async fn create_table(&mut self, table: &Table) -> Result<(), BulkError>;

    async fn patch_table_schema(
        &mut self,
        table: &Table,
        diff: &TableDiff,
    ) -> Result<(), BulkError>;

    /// Bulk-load a flushed batch file into `table`.
    async fn load_table(
        &mut self,
        table: &Table,
        source: &LoadSource,
    ) -> Result<WarehouseState, BulkError>;

    /// Copy all rows of `src` into `dst`; `merge` upserts by `dst`'s
    /// primary keys, otherwise appends.
    async fn copy_tables(
        &mut self,
        dst: &Table,
        src: &Table,
        merge: bool,
    ) -> Result<WarehouseState, BulkError>;

    /// Atomically swap `src` into the position of `dst_name` so no
    /// reader observes an empty or partial destination.
    async fn replace_table(&mut self, dst_name: &str, src: &Table) -> Result<(), BulkError>;

    async fn insert(
        &mut self,
        table: &Table,
        merge: bool,
        object: &Object,
    ) -> Result<(), BulkError>;

    async fn drop_table(&mut self, table: &Table, if_exists: bool) -> Result<(), BulkError>;

    async fn commit(&mut self) -> Result<(), BulkError>;

    async fn rollback(&mut self) -> Result<(), BulkError>;
}

/// Object-storage sink for file-storage streams.
#[async_trait]
pub trait FileAdapter: Send + Sync {
    fn format(&self) -> FileFormat;

    fn compression(&self) -> FileCompression;

    /// Avro schema JSON when [`Self::format`] is Avro.
    fn avro_schema(&self) -> Option<Value> {
        None
    }

    /// Upload a finalized batch file under the given object name.
    async fn upload(&self, name: &str, local_path: &std::path::Path) -> Result<(), BulkError>;

    async fn delete(&self, name: &str) -> Result<(), BulkError>;
}
