//! Batch mode: events accumulate in a staged tmp table and land in the
//! destination with one append (or upsert, when primary keys are
//! declared) at complete.

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

/// Transactional append/upsert stream (Batch and Merge modes).
pub struct BatchStream {
    base: TransactionalCore,
}

impl BatchStream {
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

    async fn run_commit_protocol(&mut self) -> Result<(), BulkError> {
        self.base.flush_batch_file().await?;
        self.base.copy_to_destination().await
    }
}

#[async_trait]
impl BulkLoadStream for BatchStream {
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
