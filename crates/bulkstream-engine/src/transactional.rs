//! Shared machinery for transactional streams: tmp-table lifecycle,
//! staging into the batch file or direct inserts inside the tx, the
//! flush→load step, and the commit/rollback epilogue every
//! transactional mode funnels through.

use crate::abstract_stream::StreamCore;
use crate::adapter::{LoadSource, SqlAdapter, TxAdapter};
use crate::batch_file::BatchFile;
use crate::error::BulkError;
use crate::s3::S3Stage;
use crate::state::StreamState;
use crate::table_helper::TableHelper;
use bulkstream_types::{
    new_marshaller, widen_with_policy, FileFormat, Object, Table,
};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Prefix for single-transaction staging tables.
const TMP_TABLE_PREFIX: &str = "jitsu_tmp_";

/// Length of the random tmp-table suffix.
const TMP_TABLE_SUFFIX_LEN: usize = 8;

pub(crate) struct TransactionalCore {
    pub core: StreamCore,
    pub sql: Arc<dyn SqlAdapter>,
    pub helper: TableHelper,
    pub tx: Option<Box<dyn TxAdapter>>,
    pub tmp_table: Option<Table>,
    pub dst_table: Option<Table>,
    /// Destination schema at stream start; its type annotations win
    /// when widening staged columns.
    pub existing_table: Table,
    pub batch_file: Option<BatchFile>,
    pub s3: Option<S3Stage>,
}

impl TransactionalCore {
    pub fn new(core: StreamCore, sql: Arc<dyn SqlAdapter>) -> Self {
        Self {
            core,
            sql,
            helper: TableHelper::new(),
            tx: None,
            tmp_table: None,
            dst_table: None,
            existing_table: Table::default(),
            batch_file: None,
            s3: None,
        }
    }

    /// Idempotent stream setup: staging resources, destination schema
    /// snapshot, and the transaction.
    pub async fn init(&mut self) -> Result<(), BulkError> {
        if self.core.inited {
            return Ok(());
        }
        if let Some(config) = &self.core.options.s3_batch_file {
            self.s3 = Some(S3Stage::new(config)?);
        }
        if let Some(prefix) = self.core.options.local_batch_file.clone() {
            if self.batch_file.is_none() {
                let format = self.sql.batch_file_format();
                let compression = self.sql.batch_file_compression();
                let target = new_marshaller(format, compression);
                // Without merge dedup an NDJSON target needs no rewrite,
                // so the on-disk stream can carry the final compression
                // directly. Every path that may rewrite stays on plain
                // NDJSON so the rewrite can read it line by line.
                let on_disk = if !self.core.merge && format == FileFormat::Ndjson {
                    new_marshaller(format, compression)
                } else {
                    new_marshaller(FileFormat::Ndjson, Default::default())
                };
                self.batch_file = Some(BatchFile::new(&prefix, on_disk, target)?);
            }
        }
        self.existing_table = self.sql.get_table_schema(&self.core.table_name).await?;
        if self.tx.is_none() {
            self.tx = Some(self.sql.open_tx().await?);
        }
        self.core.inited = true;
        Ok(())
    }

    pub fn column_mapper(&self) -> impl Fn(&str) -> String {
        let sql = Arc::clone(&self.sql);
        move |raw: &str| sql.column_name(raw)
    }

    fn tmp_table_name() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{TMP_TABLE_PREFIX}{}", &suffix[..TMP_TABLE_SUFFIX_LEN])
    }

    /// Set up or widen the tmp table for one object's candidate schema;
    /// the destination descriptor mirrors the staged columns.
    fn adjust_tables(&mut self, table_for_object: &Table) -> Result<(), BulkError> {
        if self.core.options.schema_freeze {
            // Freeze against the destination when it exists. With no
            // destination yet, the first object discovers the schema
            // and later objects freeze against the staged table.
            let baseline = if self.existing_table.exists() {
                Some(&self.existing_table)
            } else {
                self.tmp_table.as_ref()
            };
            if let Some(baseline) = baseline {
                reject_unknown_columns(table_for_object, baseline)?;
            }
        }

        if self.tmp_table.is_none() {
            self.dst_table = Some(table_for_object.clone());
            let mut tmp = Table::new(Self::tmp_table_name());
            tmp.temporary = true;
            tmp.columns = table_for_object.columns.clone();
            if self.core.merge {
                tmp.primary_keys = table_for_object.primary_keys.clone();
            }
            adopt_annotations(&mut tmp, &self.existing_table);
            self.tmp_table = Some(tmp);
        } else {
            let stringify = self.core.options.stringify_on_type_conflict;
            let tmp = self.tmp_table.as_mut().expect("checked above");
            widen_columns(tmp, table_for_object, &self.existing_table, stringify)?;
        }

        if let (Some(dst), Some(tmp)) = (self.dst_table.as_mut(), self.tmp_table.as_ref()) {
            dst.columns = tmp.columns.clone();
        }
        Ok(())
    }

    /// Stage one preprocessed object into the batch file.
    pub fn write_to_batch_file(
        &mut self,
        table_for_object: &Table,
        object: &Object,
        column_name: &dyn Fn(&str) -> String,
    ) -> Result<(), BulkError> {
        self.adjust_tables(table_for_object)?;
        let pk = if self.core.merge {
            Some(self.core.pk_value(object, column_name)?)
        } else {
            None
        };
        let batch = self
            .batch_file
            .as_mut()
            .ok_or_else(|| BulkError::staging("batch file", "stream has no staging file"))?;
        batch.append(object, pk.as_deref(), &[])
    }

    /// Insert one preprocessed object directly into the tmp table,
    /// reconciling its schema inside the tx so intra-tx changes are
    /// visible to this insert.
    pub async fn insert(
        &mut self,
        table_for_object: &Table,
        object: &Object,
    ) -> Result<(), BulkError> {
        self.adjust_tables(table_for_object)?;
        let desired = self
            .tmp_table
            .clone()
            .expect("tmp table is set by adjust_tables");
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| BulkError::load("insert", "transaction is not open"))?;
        let ensured = TableHelper::ensure_table_without_caching(
            tx.as_mut(),
            &desired,
            self.core.options.stringify_on_type_conflict,
        )
        .await?;
        self.tmp_table = Some(ensured.clone());
        tx.insert(&ensured, self.core.merge, object).await
    }

    /// Shared consume flow for every transactional mode. `stamp` is
    /// applied to the raw object before preprocessing (partition id).
    pub async fn consume(
        &mut self,
        object: Object,
        stamp: Option<(&str, serde_json::Value)>,
    ) -> (StreamState, Result<(), BulkError>) {
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        // A fatal error poisons the stream: short-circuit with the same
        // error until the caller completes or aborts.
        if let Some(err) = self.core.last_error.clone() {
            return (self.core.state.clone(), Err(err));
        }
        let result = self.consume_inner(object, stamp).await;
        let result = self.core.post_consume(result, true);
        (self.core.state.clone(), result)
    }

    async fn consume_inner(
        &mut self,
        mut object: Object,
        stamp: Option<(&str, serde_json::Value)>,
    ) -> Result<(), BulkError> {
        self.init().await?;
        if let Some((column, value)) = stamp {
            object.insert(column.to_string(), value);
        }
        self.core.track_event_time(&object);
        let column_name = self.column_mapper();
        let (table_for_object, processed) = self.core.preprocess(object, &column_name)?;
        if self.batch_file.is_some() {
            self.write_to_batch_file(&table_for_object, &processed, &column_name)
        } else {
            self.insert(&table_for_object, &processed).await
        }
    }

    /// Create the tmp table and bulk-load the finalized batch file into
    /// it. The tmp table is created even for an empty batch so swap-based
    /// modes can land an empty table of the discovered schema.
    pub async fn flush_batch_file(&mut self) -> Result<(), BulkError> {
        let Some(tmp) = self.tmp_table.clone() else {
            return Ok(());
        };
        // The direct-insert path already created and filled the tmp
        // table inside the tx.
        if self.batch_file.is_none() {
            return Ok(());
        }
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| BulkError::load("flush", "transaction is not open"))?;
        tx.create_table(&tmp).await?;

        let batch = self.batch_file.take().expect("batch file checked above");
        if batch.events() == 0 {
            return Ok(());
        }

        let header = tmp.sorted_column_names();
        let avro_schema = if batch.target_format() == FileFormat::Avro {
            self.sql.avro_schema(&tmp)
        } else {
            None
        };
        let flushed = batch.finalize(&header, avro_schema.as_ref())?;

        let warehouse = if let Some(s3) = &self.s3 {
            let key = s3.object_key(&flushed.file_name());
            s3.upload(&key, flushed.path()).await?;
            let config = self
                .core
                .options
                .s3_batch_file
                .clone()
                .expect("s3 stage implies s3 option");
            let source = LoadSource::S3 {
                key: key.clone(),
                format: flushed.format(),
                config,
            };
            let result = tx.load_table(&tmp, &source).await;
            if let Err(err) = s3.delete(&key).await {
                warn!(stream = %self.core.id, key, %err, "failed to delete staging object");
            }
            result?
        } else {
            let source = LoadSource::Local {
                path: flushed.path().to_path_buf(),
                format: flushed.format(),
            };
            tx.load_table(&tmp, &source).await?
        };
        self.core.state.add_warehouse_state(&warehouse);
        Ok(())
    }

    /// Reconcile the destination (cached per stream) and copy the staged
    /// rows into it.
    pub async fn copy_to_destination(&mut self) -> Result<(), BulkError> {
        let Some(tmp) = self.tmp_table.clone() else {
            return Ok(());
        };
        let mut dst = self
            .dst_table
            .clone()
            .expect("destination descriptor is set with the tmp table");
        dst.columns = tmp.columns.clone();
        let ensured = self
            .helper
            .ensure_table_with_caching(
                self.sql.as_ref(),
                &self.core.id,
                &dst,
                self.core.options.stringify_on_type_conflict,
            )
            .await?;
        self.dst_table = Some(ensured.clone());
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| BulkError::load("copy", "transaction is not open"))?;
        let warehouse = tx.copy_tables(&ensured, &tmp, self.core.merge).await?;
        self.core.state.add_warehouse_state(&warehouse);
        Ok(())
    }

    /// Epilogue shared by every transactional complete path: release the
    /// batch file, drop the tmp table, then commit or roll back. A
    /// rollback failure is logged and never replaces the original error.
    pub async fn post_complete(
        &mut self,
        err: Option<BulkError>,
    ) -> (StreamState, Result<(), BulkError>) {
        self.batch_file = None;
        let final_err = match err {
            Some(err) => {
                self.core.state.successful_rows = 0;
                if let Some(tx) = self.tx.as_mut() {
                    if let Some(tmp) = &self.tmp_table {
                        let _ = tx.drop_table(tmp, true).await;
                    }
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(stream = %self.core.id, %rollback_err, "rollback failed");
                    }
                }
                Some(err)
            }
            None => {
                let mut commit_err = None;
                if let Some(tx) = self.tx.as_mut() {
                    if let Some(tmp) = &self.tmp_table {
                        if let Err(drop_err) = tx.drop_table(tmp, true).await {
                            warn!(stream = %self.core.id, %drop_err, "failed to drop tmp table");
                        }
                    }
                    if let Err(err) = tx.commit().await {
                        self.core.state.successful_rows = 0;
                        commit_err = Some(err);
                    }
                }
                commit_err
            }
        };
        self.tx = None;
        self.core.post_complete(final_err)
    }

    /// Abort: drop the tmp table, roll back, discard staging state.
    /// Repeating an abort is a no-op.
    pub async fn abort(&mut self) -> (StreamState, Result<(), BulkError>) {
        if self.core.state.status == crate::state::StreamStatus::Aborted {
            return (self.core.state.clone(), Ok(()));
        }
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        if let Some(tx) = self.tx.as_mut() {
            if let Some(tmp) = &self.tmp_table {
                let _ = tx.drop_table(tmp, true).await;
            }
            let _ = tx.rollback().await;
        }
        self.tx = None;
        self.batch_file = None;
        self.helper.forget(&self.core.id);
        self.core.state.status = crate::state::StreamStatus::Aborted;
        (self.core.state.clone(), Ok(()))
    }
}

/// Widen `target` so it accepts `incoming`, adopting the destination's
/// type annotations on every touched column.
pub(crate) fn widen_columns(
    target: &mut Table,
    incoming: &Table,
    annotations: &Table,
    stringify: bool,
) -> Result<(), BulkError> {
    for (name, column) in &incoming.columns {
        match target.columns.get_mut(name) {
            None => {
                let mut added = column.clone();
                if let Some(existing) = annotations.columns.get(name) {
                    added.kind = widen_with_policy(name, existing.kind, added.kind, stringify)?;
                    if added.sql_type.is_none() {
                        added.sql_type = existing.sql_type.clone();
                    }
                }
                target.columns.insert(name.clone(), added);
            }
            Some(current) => {
                current.kind = widen_with_policy(name, current.kind, column.kind, stringify)?;
                if current.sql_type.is_none() {
                    current.sql_type = annotations
                        .columns
                        .get(name)
                        .and_then(|c| c.sql_type.clone())
                        .or_else(|| column.sql_type.clone());
                }
            }
        }
    }
    Ok(())
}

/// Copy destination annotations onto a freshly created staged schema.
fn adopt_annotations(table: &mut Table, annotations: &Table) {
    for (name, column) in table.columns.iter_mut() {
        if column.sql_type.is_none() {
            if let Some(existing) = annotations.columns.get(name) {
                column.sql_type = existing.sql_type.clone();
            }
        }
    }
}

/// Schema freeze: every incoming column must already be known.
pub(crate) fn reject_unknown_columns(incoming: &Table, baseline: &Table) -> Result<(), BulkError> {
    for name in incoming.columns.keys() {
        if !baseline.columns.contains_key(name) {
            return Err(BulkError::SchemaFrozen {
                column: name.clone(),
            });
        }
    }
    Ok(())
}
