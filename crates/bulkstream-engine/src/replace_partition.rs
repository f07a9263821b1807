//! ReplacePartition mode: every object is stamped with the stream's
//! partition id, previous rows of that partition are deleted, and the
//! staged rows are copied in. The partition delete runs with autocommit
//! on the session adapter, outside the stream's tx, so an empty stream
//! still clears its partition.

use crate::abstract_stream::{StreamCore, PARTITION_ID_COLUMN};
use crate::adapter::{DeletePredicate, SqlAdapter};
use crate::error::BulkError;
use crate::options::StreamOptions;
use crate::state::StreamState;
use crate::transactional::TransactionalCore;
use crate::BulkLoadStream;
use async_trait::async_trait;
use bulkstream_types::Object;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct ReplacePartitionStream {
    base: TransactionalCore,
    partition_id: String,
}

impl ReplacePartitionStream {
    pub(crate) fn new(
        id: &str,
        sql: Arc<dyn SqlAdapter>,
        table_name: &str,
        options: StreamOptions,
    ) -> Result<Self, BulkError> {
        let partition_id = options
            .partition_id
            .clone()
            .ok_or_else(|| BulkError::config("partition_id is required for partition replace"))?;
        let merge = !options.primary_keys.is_empty();
        let core = StreamCore::new(id, table_name, options, merge, true);
        Ok(Self {
            base: TransactionalCore::new(core, sql),
            partition_id,
        })
    }

    /// Delete the previous generation of this partition. Fatal when the
    /// destination exists but carries no partition column: the table is
    /// not managed by partition replace and deleting from it would be
    /// wrong either way.
    async fn clear_partition(&mut self) -> Result<(), BulkError> {
        let table = self
            .base
            .sql
            .get_table_schema(&self.base.core.table_name)
            .await?;
        if !table.exists() {
            return Ok(());
        }
        if !table.columns.contains_key(PARTITION_ID_COLUMN) {
            return Err(BulkError::load(
                "partition replace",
                format!(
                    "destination table '{}' exists but is not managed by partition replace: '{}' column is missing",
                    self.base.core.table_name, PARTITION_ID_COLUMN
                ),
            ));
        }
        self.base
            .sql
            .delete(
                &self.base.core.table_name,
                &DeletePredicate {
                    column: PARTITION_ID_COLUMN.to_string(),
                    value: Value::String(self.partition_id.clone()),
                },
            )
            .await?;
        info!(
            stream = %self.base.core.id,
            partition = %self.partition_id,
            "cleared previous partition data"
        );
        Ok(())
    }

    async fn run_commit_protocol(&mut self) -> Result<(), BulkError> {
        self.clear_partition().await?;
        // Empty stream is valid: no data for the sync period, the delete
        // above is the whole effect.
        if self.base.core.state.successful_rows > 0 {
            self.base.flush_batch_file().await?;
            self.base.copy_to_destination().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BulkLoadStream for ReplacePartitionStream {
    async fn consume(&mut self, object: Object) -> (StreamState, Result<(), BulkError>) {
        let stamp = (
            PARTITION_ID_COLUMN,
            Value::String(self.partition_id.clone()),
        );
        self.base.consume(object, Some(stamp)).await
    }

    async fn complete(&mut self) -> (StreamState, Result<(), BulkError>) {
        if let Err(err) = self.base.core.check_active() {
            return (self.base.core.state.clone(), Err(err));
        }
        let err = match self.base.core.last_error.clone() {
            Some(err) => Some(err),
            None => self.run_commit_protocol().await.err(),
        };
        self.base.post_complete(err).await
    }

    async fn abort(&mut self) -> (StreamState, Result<(), BulkError>) {
        self.base.abort().await
    }
}
