//! Stream mode: every object lands in the destination immediately with
//! autocommit. Row failures are reported but never undo prior rows.

use crate::abstract_stream::StreamCore;
use crate::adapter::SqlAdapter;
use crate::error::BulkError;
use crate::options::StreamOptions;
use crate::state::{StreamState, StreamStatus};
use crate::table_helper::TableHelper;
use crate::transactional::widen_columns;
use crate::BulkLoadStream;
use async_trait::async_trait;
use bulkstream_types::{Object, Table};
use std::sync::Arc;

pub struct AutoCommitStream {
    core: StreamCore,
    sql: Arc<dyn SqlAdapter>,
    helper: TableHelper,
    dst_table: Option<Table>,
    existing_table: Table,
}

impl AutoCommitStream {
    pub(crate) fn new(
        id: &str,
        sql: Arc<dyn SqlAdapter>,
        table_name: &str,
        options: StreamOptions,
    ) -> Self {
        // Declared primary keys turn per-row inserts into upserts, so
        // repeated runs keep keys unique.
        let merge = !options.primary_keys.is_empty();
        let core = StreamCore::new(id, table_name, options, merge, true);
        Self {
            core,
            sql,
            helper: TableHelper::new(),
            dst_table: None,
            existing_table: Table::default(),
        }
    }

    async fn init(&mut self) -> Result<(), BulkError> {
        if self.core.inited {
            return Ok(());
        }
        self.existing_table = self.sql.get_table_schema(&self.core.table_name).await?;
        self.core.inited = true;
        Ok(())
    }

    async fn consume_inner(&mut self, object: Object) -> Result<(), BulkError> {
        self.init().await?;
        self.core.track_event_time(&object);
        let sql = Arc::clone(&self.sql);
        let column_name = move |raw: &str| sql.column_name(raw);
        let (table_for_object, processed) = self.core.preprocess(object, &column_name)?;

        if self.core.options.schema_freeze {
            // Freeze against the destination when it exists. With no
            // destination yet, the first object discovers the schema
            // and later objects freeze against it.
            let baseline = if self.existing_table.exists() {
                Some(&self.existing_table)
            } else {
                self.dst_table.as_ref()
            };
            if let Some(baseline) = baseline {
                crate::transactional::reject_unknown_columns(&table_for_object, baseline)?;
            }
        }

        if self.dst_table.is_none() {
            self.dst_table = Some(table_for_object.clone());
        } else {
            let stringify = self.core.options.stringify_on_type_conflict;
            let dst = self.dst_table.as_mut().expect("checked above");
            widen_columns(dst, &table_for_object, &self.existing_table, stringify)?;
        }
        let desired = self.dst_table.clone().expect("destination descriptor set");
        let ensured = self
            .helper
            .ensure_table_with_caching(
                self.sql.as_ref(),
                &self.core.id,
                &desired,
                self.core.options.stringify_on_type_conflict,
            )
            .await?;
        self.dst_table = Some(ensured.clone());
        self.sql.insert(&ensured, self.core.merge, &processed).await
    }
}

#[async_trait]
impl BulkLoadStream for AutoCommitStream {
    async fn consume(&mut self, object: Object) -> (StreamState, Result<(), BulkError>) {
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        let result = self.consume_inner(object).await;
        // Non-transactional: the error is reported but the stream keeps
        // accepting rows.
        let result = self.core.post_consume(result, false);
        (self.core.state.clone(), result)
    }

    async fn complete(&mut self) -> (StreamState, Result<(), BulkError>) {
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        // Accepted rows are already committed; completing only
        // finalizes the state.
        self.core.post_complete(None)
    }

    async fn abort(&mut self) -> (StreamState, Result<(), BulkError>) {
        if self.core.state.status == StreamStatus::Aborted {
            return (self.core.state.clone(), Ok(()));
        }
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        self.helper.forget(&self.core.id);
        self.core.state.status = StreamStatus::Aborted;
        (self.core.state.clone(), Ok(()))
    }
}
