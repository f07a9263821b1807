//! Stream status machine and run counters.

use crate::error::BulkError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle status of a stream.
///
/// Transitions are monotonic: `Active` moves to exactly one of the
/// terminal states and nothing ever returns to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Active,
    Completed,
    Failed,
    Aborted,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Load telemetry returned by the destination adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarehouseState {
    pub name: String,
    pub rows: u64,
    pub bytes: u64,
    pub time_processed_ms: u64,
}

impl WarehouseState {
    /// Accumulate telemetry across load/copy steps of one stream.
    pub fn merge(&mut self, other: &WarehouseState) {
        if self.name.is_empty() {
            self.name = other.name.clone();
        }
        self.rows += other.rows;
        self.bytes += other.bytes;
        self.time_processed_ms += other.time_processed_ms;
    }
}

/// Observable state of one stream instance.
///
/// Counters reflect acceptance during the run; a failed `complete`
/// resets `successful_rows` to zero because nothing was committed.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub status: StreamStatus,
    pub processed_rows: u64,
    pub successful_rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_row_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warehouse_state: Option<WarehouseState>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            status: StreamStatus::Active,
            processed_rows: 0,
            successful_rows: 0,
            error_row_index: None,
            last_error: None,
            first_event_time: None,
            last_event_time: None,
            warehouse_state: None,
        }
    }

    pub fn set_error(&mut self, err: &BulkError) {
        self.last_error = Some(err.to_string());
    }

    pub fn track_event_time(&mut self, event_time: DateTime<Utc>) {
        if self
            .first_event_time
            .map_or(true, |first| event_time < first)
        {
            self.first_event_time = Some(event_time);
        }
        if self.last_event_time.map_or(true, |last| event_time > last) {
            self.last_event_time = Some(event_time);
        }
    }

    pub fn add_warehouse_state(&mut self, other: &WarehouseState) {
        self.warehouse_state
            .get_or_insert_with(WarehouseState::default)
            .merge(other);
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}
