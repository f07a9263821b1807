//! Stream lifecycle engine for bulk-loading semi-structured events into
//! SQL warehouses and object-storage sinks.
//!
//! A stream is one bounded ingestion session with a chosen [`BulkMode`]:
//! per-row autocommit append, transactional batch append, primary-key
//! merge, atomic full-table replace, or partition-scoped replace.
//! Destinations plug in through [`SqlAdapter`] / [`FileAdapter`]; the
//! engine owns staging, schema evolution, deduplication, and the commit
//! protocol.

pub mod abstract_stream;
pub mod adapter;
pub mod autocommit;
pub mod batch;
pub mod batch_file;
pub mod error;
pub mod file_storage;
pub mod options;
pub mod replace_partition;
pub mod replace_table;
pub mod s3;
pub mod state;
pub mod table_helper;
pub mod transactional;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use abstract_stream::PARTITION_ID_COLUMN;
pub use adapter::{DeletePredicate, FileAdapter, LoadSource, SqlAdapter, TxAdapter};
pub use batch_file::{BatchFile, FlushedBatch};
pub use bulkstream_types::{
    DataKind, FileCompression, FileFormat, Object, Table, TableDiff,
};
pub use error::BulkError;
pub use file_storage::FilenameFunc;
pub use options::{StreamOption, StreamOptions};
pub use s3::S3StageConfig;
pub use state::{StreamState, StreamStatus, WarehouseState};
pub use table_helper::TableHelper;

use autocommit::AutoCommitStream;
use batch::BatchStream;
use file_storage::FileStorageStream;
use replace_partition::ReplacePartitionStream;
use replace_table::ReplaceTableStream;

/// Commit semantics of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMode {
    /// Append with per-row autocommit.
    Stream,
    /// Append staged in one transaction.
    Batch,
    /// Primary-key upsert staged in one transaction.
    Merge,
    /// Atomic full-table replace.
    ReplaceTable,
    /// Partition-scoped replace.
    ReplacePartition,
}

impl fmt::Display for BulkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stream => "stream",
            Self::Batch => "batch",
            Self::Merge => "merge",
            Self::ReplaceTable => "replace_table",
            Self::ReplacePartition => "replace_partition",
        };
        f.write_str(s)
    }
}

/// One bounded ingestion session.
///
/// `consume`, `complete`, and `abort` are serialized by the caller; the
/// engine spawns no background work per stream. Every call returns the
/// observable state alongside the outcome, because counters move even
/// when a row is rejected.
#[async_trait]
pub trait BulkLoadStream: Send {
    async fn consume(&mut self, object: Object) -> (StreamState, Result<(), BulkError>);

    async fn complete(&mut self) -> (StreamState, Result<(), BulkError>);

    async fn abort(&mut self) -> (StreamState, Result<(), BulkError>);
}

/// Create a stream against a SQL warehouse destination.
///
/// Option validation happens here: a missing required option is a
/// [`BulkError::Config`] and no stream is constructed.
pub fn create_stream(
    id: &str,
    sql: Arc<dyn SqlAdapter>,
    table_name: &str,
    mode: BulkMode,
    options: &[StreamOption],
) -> Result<Box<dyn BulkLoadStream>, BulkError> {
    let mut resolved = StreamOptions::resolve(options);
    // Routing staging through S3 implies a local batch file to stage.
    if resolved.s3_batch_file.is_some() && resolved.local_batch_file.is_none() {
        resolved.local_batch_file = Some("bulkstream_batch".to_string());
    }
    match mode {
        BulkMode::Stream => Ok(Box::new(AutoCommitStream::new(id, sql, table_name, resolved))),
        BulkMode::Batch => Ok(Box::new(BatchStream::new(id, sql, table_name, resolved))),
        BulkMode::Merge => {
            if resolved.primary_keys.is_empty() {
                return Err(BulkError::config(
                    "primary_key is required for merge streams",
                ));
            }
            Ok(Box::new(BatchStream::new(id, sql, table_name, resolved)))
        }
        BulkMode::ReplaceTable => Ok(Box::new(ReplaceTableStream::new(
            id, sql, table_name, resolved,
        ))),
        BulkMode::ReplacePartition => Ok(Box::new(ReplacePartitionStream::new(
            id, sql, table_name, resolved,
        )?)),
    }
}

/// Create a stream against an object-storage sink.
pub fn create_file_stream(
    id: &str,
    adapter: Arc<dyn FileAdapter>,
    filename_func: FilenameFunc,
    options: &[StreamOption],
) -> Result<Box<dyn BulkLoadStream>, BulkError> {
    let resolved = StreamOptions::resolve(options);
    Ok(Box::new(FileStorageStream::new(
        id,
        adapter,
        filename_func,
        resolved,
    )?))
}
