//! ReplaceTable mode: stage everything, then atomically swap the staged
//! table into the destination's place so no reader ever observes a
//! partial table.

use crate::abstract_stream::StreamCore;
use crate::adapter::SqlAdapter;
use crate::error::BulkError;
use crate::options::StreamOptions;
use crate::state::StreamState;
use crate::transactional::TransactionalCore;
use crate::BulkLoadStream;
use async_trait::async_trait;
use bulkstream_types::Object;
use std::sync::Arc;

pub struct ReplaceTableStream {
    base: TransactionalCore,
}

impl ReplaceTableStream {
    pub(crate) fn new(
        id: &str,
        sql: Arc<dyn SqlAdapter>,
        table_name: &str,
        options: StreamOptions,
    ) -> Self {
        let merge = !options.primary_keys.is_empty();
        let core = StreamCore::new(id, table_name, options, merge, true);
        Self {
            base: TransactionalCore::new(core, sql),
        }
    }

    /// Replace means "this is the full state as of now": a stream that
    /// discovered a schema but staged zero rows still swaps an empty
    /// table in, while a stream that never saw an object leaves the
    /// destination untouched.
    async fn run_commit_protocol(&mut self) -> Result<(), BulkError> {
        if self.base.tmp_table.is_none() {
            return Ok(());
        }
        self.base.flush_batch_file().await?;
        let tmp = self
            .base
            .tmp_table
            .clone()
            .expect("tmp table checked above");
        let table_name = self.base.core.table_name.clone();
        let tx = self
            .base
            .tx
            .as_mut()
            .ok_or_else(|| BulkError::load("replace", "transaction is not open"))?;
        tx.replace_table(&table_name, &tmp).await?;
        // The swap consumed the tmp table; the epilogue's drop-if-exists
        // is a no-op.
        Ok(())
    }
}

#[async_trait]
impl BulkLoadStream for ReplaceTableStream {
    async fn consume(&mut self, object: Object) -> (StreamState, Result<(), BulkError>) {
        self.base.consume(object, None).await
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
