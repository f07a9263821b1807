//! Schema reconciliation against the destination, with and without the
//! per-stream memoization that keeps repeated mid-batch consumes from
//! re-running ALTER round-trips.

use crate::adapter::{SqlAdapter, TxAdapter};
use crate::error::BulkError;
use bulkstream_types::Table;
use std::collections::HashMap;
use tracing::debug;

/// Reconciles desired schemas with the destination.
///
/// The cache is keyed by stream id and table name, so a stream that
/// consumes millions of objects pays for schema discovery once per
/// actual change. Reconciliation is additive only: columns are added or
/// widened, never dropped or narrowed.
#[derive(Default)]
pub struct TableHelper {
    cache: HashMap<String, Table>,
}

impl TableHelper {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(stream_id: &str, table_name: &str) -> String {
        format!("{stream_id}:{table_name}")
    }

    /// Ensure the destination accepts `desired`, memoized by stream id.
    ///
    /// Runs DDL with autocommit on the session adapter; used by the
    /// commit protocols and the autocommit stream, where schema changes
    /// must stick regardless of the surrounding tx outcome.
    pub async fn ensure_table_with_caching(
        &mut self,
        sql: &dyn SqlAdapter,
        stream_id: &str,
        desired: &Table,
        stringify: bool,
    ) -> Result<Table, BulkError> {
        let key = Self::cache_key(stream_id, &desired.name);
        let current = match self.cache.get(&key) {
            Some(cached) => cached.clone(),
            None => sql.get_table_schema(&desired.name).await?,
        };
        let reconciled = reconcile(sql, &current, desired, stringify).await?;
        self.cache.insert(key, reconciled.clone());
        Ok(reconciled)
    }

    /// Ensure a table inside the open transaction, with no caching, so
    /// intra-tx schema changes are visible to subsequent inserts.
    pub async fn ensure_table_without_caching(
        tx: &mut dyn TxAdapter,
        desired: &Table,
        stringify: bool,
    ) -> Result<Table, BulkError> {
        let current = tx.get_table_schema(&desired.name).await?;
        if !current.exists() {
            tx.create_table(desired).await?;
            return Ok(desired.clone());
        }
        let diff = desired.diff(&current, stringify)?;
        if diff.is_empty() {
            return Ok(merged_descriptor(&current, desired, stringify)?);
        }
        tx.patch_table_schema(&current, &diff).await?;
        let mut patched = current;
        patched.apply_diff(&diff);
        Ok(merged_descriptor(&patched, desired, stringify)?)
    }

    /// Drop cached entries for one stream, e.g. after abort.
    pub fn forget(&mut self, stream_id: &str) {
        self.cache
            .retain(|key, _| !key.starts_with(&format!("{stream_id}:")));
    }
}

async fn reconcile(
    sql: &dyn SqlAdapter,
    current: &Table,
    desired: &Table,
    stringify: bool,
) -> Result<Table, BulkError> {
    if !current.exists() {
        sql.create_table(desired).await?;
        debug!(table = %desired.name, "created destination table");
        return Ok(desired.clone());
    }
    let diff = desired.diff(current, stringify)?;
    if diff.is_empty() {
        return merged_descriptor(current, desired, stringify);
    }
    sql.patch_table_schema(current, &diff).await?;
    debug!(
        table = %desired.name,
        added = diff.added_columns.len(),
        widened = diff.widened_columns.len(),
        "patched destination schema"
    );
    let mut patched = current.clone();
    patched.apply_diff(&diff);
    merged_descriptor(&patched, desired, stringify)
}

/// Descriptor for later operations: destination columns (annotations
/// included) plus the stream's key metadata.
fn merged_descriptor(
    destination: &Table,
    desired: &Table,
    stringify: bool,
) -> Result<Table, BulkError> {
    let mut merged = destination.merge(desired, stringify)?;
    merged.name = desired.name.clone();
    merged.primary_keys = desired.primary_keys.clone();
    merged.partition_key = desired.partition_key.clone();
    merged.temporary = desired.temporary;
    Ok(merged)
}
