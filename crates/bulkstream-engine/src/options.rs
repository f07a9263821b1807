//! Stream options accepted by the `create_stream` factories.

use crate::s3::S3StageConfig;

/// One option for a stream instance.
#[derive(Debug, Clone)]
pub enum StreamOption {
    /// Primary key columns. Required by Merge mode; enables
    /// deduplication in Merge and file-storage merge mode.
    PrimaryKey(Vec<String>),
    /// Enables merge for file-storage mode.
    MergeRows(bool),
    /// Partition id stamped on every object; required by
    /// ReplacePartition mode.
    PartitionId(String),
    /// Column used for first/last event-time tracking.
    Timestamp(String),
    /// Enable a local staging file for SQL modes, with this name prefix.
    LocalBatchFile(String),
    /// Route the staging file through S3 before loading.
    S3BatchFile(S3StageConfig),
    /// Reject new columns discovered mid-stream.
    SchemaFreeze(bool),
    /// Permit the any-to-string fallback on type conflicts.
    StringifyOnTypeConflict(bool),
}

/// Resolved option set.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub primary_keys: Vec<String>,
    pub merge_rows: bool,
    pub partition_id: Option<String>,
    pub timestamp_column: Option<String>,
    pub local_batch_file: Option<String>,
    pub s3_batch_file: Option<S3StageConfig>,
    pub schema_freeze: bool,
    pub stringify_on_type_conflict: bool,
}

impl StreamOptions {
    pub fn resolve(options: &[StreamOption]) -> Self {
        let mut resolved = Self::default();
        for option in options {
            match option {
                StreamOption::PrimaryKey(columns) => {
                    resolved.primary_keys = columns.clone();
                }
                StreamOption::MergeRows(enabled) => resolved.merge_rows = *enabled,
                StreamOption::PartitionId(id) => resolved.partition_id = Some(id.clone()),
                StreamOption::Timestamp(column) => {
                    resolved.timestamp_column = Some(column.clone());
                }
                StreamOption::LocalBatchFile(prefix) => {
                    resolved.local_batch_file = Some(prefix.clone());
                }
                StreamOption::S3BatchFile(config) => {
                    resolved.s3_batch_file = Some(config.clone());
                }
                StreamOption::SchemaFreeze(enabled) => resolved.schema_freeze = *enabled,
                StreamOption::StringifyOnTypeConflict(enabled) => {
                    resolved.stringify_on_type_conflict = *enabled;
                }
            }
        }
        resolved
    }
}
