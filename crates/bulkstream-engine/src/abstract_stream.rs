//! Shared ingress core for every stream flavor: option resolution,
//! event-time tracking, preprocessing, and the post-consume /
//! post-complete bookkeeping that drives the state machine.

use crate::error::BulkError;
use crate::options::StreamOptions;
use crate::state::{StreamState, StreamStatus};
use bulkstream_types::{flatten_object, induce_table, Object, Table};
use chrono::Utc;
use serde_json::Value;
use std::time::Instant;
use tracing::info;

/// Column stamped on every object of a partition-scoped replace.
pub const PARTITION_ID_COLUMN: &str = "__partition_id";

/// Separator for multi-column primary key strings; unlikely enough that
/// concatenated values cannot alias across columns.
const PK_VALUE_SEPARATOR: &str = "_###_";

/// State and behavior common to all streams.
pub(crate) struct StreamCore {
    pub id: String,
    pub table_name: String,
    pub options: StreamOptions,
    /// Upsert semantics requested for this stream.
    pub merge: bool,
    /// Flatten nested objects during preprocessing.
    pub flatten: bool,
    pub pk_columns: Vec<String>,
    pub state: StreamState,
    /// First fatal error; transactional streams return it from every
    /// later call and the commit path observes it.
    pub last_error: Option<BulkError>,
    pub start_time: Instant,
    pub inited: bool,
}

impl StreamCore {
    pub fn new(
        id: impl Into<String>,
        table_name: impl Into<String>,
        options: StreamOptions,
        merge: bool,
        flatten: bool,
    ) -> Self {
        let pk_columns = options.primary_keys.clone();
        Self {
            id: id.into(),
            table_name: table_name.into(),
            options,
            merge,
            flatten,
            pk_columns,
            state: StreamState::new(),
            last_error: None,
            start_time: Instant::now(),
            inited: false,
        }
    }

    pub fn check_active(&self) -> Result<(), BulkError> {
        if self.state.status == StreamStatus::Active {
            Ok(())
        } else {
            Err(BulkError::state(self.state.status))
        }
    }

    /// Track first/last event time from the configured timestamp column,
    /// falling back to the wall clock.
    pub fn track_event_time(&mut self, object: &Object) {
        let event_time = self
            .options
            .timestamp_column
            .as_deref()
            .and_then(|column| object.get(column))
            .and_then(bulkstream_types::reformat_time_value)
            .unwrap_or_else(Utc::now);
        self.state.track_event_time(event_time);
    }

    /// Flatten, map column names, and induce the candidate table for one
    /// object.
    pub fn preprocess(
        &self,
        object: Object,
        column_name: &dyn Fn(&str) -> String,
    ) -> Result<(Table, Object), BulkError> {
        let flat = if self.flatten {
            flatten_object(&object).map_err(|e| BulkError::preprocess(e.to_string()))?
        } else {
            object
        };
        let mut mapped = Object::new();
        for (key, value) in flat {
            mapped.insert(column_name(&key), value);
        }
        let pk_columns: Vec<String> = self.pk_columns.iter().map(|c| column_name(c)).collect();
        let partition_key = self
            .options
            .partition_id
            .as_ref()
            .map(|_| PARTITION_ID_COLUMN);
        let table = induce_table(&self.table_name, &mapped, &pk_columns, partition_key);
        Ok((table, mapped))
    }

    /// Primary key string of one preprocessed object.
    pub fn pk_value(
        &self,
        object: &Object,
        column_name: &dyn Fn(&str) -> String,
    ) -> Result<String, BulkError> {
        if self.pk_columns.is_empty() {
            return Err(BulkError::preprocess("primary key is not set"));
        }
        let mut parts = Vec::with_capacity(self.pk_columns.len());
        let mut found = false;
        for column in &self.pk_columns {
            match object.get(&column_name(column)) {
                Some(value) => {
                    found = true;
                    parts.push(render_pk_value(value));
                }
                None => parts.push(String::new()),
            }
        }
        if !found {
            return Err(BulkError::preprocess(
                "primary key columns not found in the object",
            ));
        }
        Ok(parts.join(PK_VALUE_SEPARATOR))
    }

    /// Row accounting after one consume attempt. Returns the error back
    /// to the caller; for transactional streams it also latches as the
    /// stream's fatal error so the commit path rolls back.
    pub fn post_consume(
        &mut self,
        result: Result<(), BulkError>,
        transactional: bool,
    ) -> Result<(), BulkError> {
        let outcome = match result {
            Ok(()) => {
                self.state.successful_rows += 1;
                Ok(())
            }
            Err(err) => {
                self.state.error_row_index = Some(self.state.processed_rows);
                self.state.set_error(&err);
                if transactional {
                    self.last_error = Some(err.clone());
                }
                Err(err)
            }
        };
        self.state.processed_rows += 1;
        outcome
    }

    /// Final status transition shared by every complete path.
    pub fn post_complete(&mut self, err: Option<BulkError>) -> (StreamState, Result<(), BulkError>) {
        match err {
            Some(err) => {
                self.state.set_error(&err);
                self.state.status = StreamStatus::Failed;
                (self.state.clone(), Err(err))
            }
            None => {
                self.state.status = StreamStatus::Completed;
                let secs = self.start_time.elapsed().as_secs_f64();
                info!(
                    stream = %self.id,
                    rows = self.state.successful_rows,
                    "stream completed in {:.2}s ({:.2} events/sec)",
                    secs,
                    self.state.successful_rows as f64 / secs.max(f64::EPSILON)
                );
                (self.state.clone(), Ok(()))
            }
        }
    }
}

fn render_pk_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
