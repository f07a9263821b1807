//! Typed error model for stream operations.
//!
//! Variants map one-to-one onto the engine's failure classes: row-level
//! errors (`SchemaConflict`, `Preprocess`) are recorded into stream state
//! without poisoning non-transactional streams, while `Staging` and
//! `Load` are stream-fatal and force a rollback. `State` and `Config`
//! never touch a live stream at all.

use crate::state::StreamStatus;
use bulkstream_types::TypeConflict;

/// Stream operation failure.
///
/// `Clone` is deliberate: a transactional stream stores the first fatal
/// error and returns the same error from every subsequent call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BulkError {
    /// Incompatible type change for a column; row-level unless the
    /// stream's schema policy escalates it.
    #[error("schema conflict: {0}")]
    SchemaConflict(#[from] TypeConflict),

    /// New column rejected by a frozen schema; row-level.
    #[error("schema is frozen, rejecting new column '{column}'")]
    SchemaFrozen { column: String },

    /// Flattening or primary-key extraction failed; row-level.
    #[error("preprocess failed: {message}")]
    Preprocess { message: String },

    /// Local or remote I/O during batch file write/flush; stream-fatal.
    #[error("staging failed: {message}")]
    Staging { message: String },

    /// Warehouse load/copy/delete failed; stream-fatal, rolls back.
    #[error("load failed: {message}")]
    Load { message: String },

    /// Operation invoked on a stream that is no longer active; returned
    /// as-is with no side effects.
    #[error("stream is not active (status: {status})")]
    State { status: StreamStatus },

    /// Missing or inconsistent stream options; raised at creation, no
    /// stream is constructed.
    #[error("invalid stream configuration: {message}")]
    Config { message: String },
}

impl BulkError {
    pub fn preprocess(message: impl Into<String>) -> Self {
        Self::Preprocess {
            message: message.into(),
        }
    }

    /// Staging error decorated with the failing step.
    pub fn staging(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Staging {
            message: format!("{context}: {err}"),
        }
    }

    /// Load error decorated with the failing step; adapter errors
    /// surface verbatim in the message.
    pub fn load(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Load {
            message: format!("{context}: {err}"),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn state(status: StreamStatus) -> Self {
        Self::State { status }
    }

    /// Row-level errors are recorded into state but do not terminate
    /// non-transactional streams.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            Self::SchemaConflict(_) | Self::SchemaFrozen { .. } | Self::Preprocess { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkstream_types::DataKind;

    #[test]
    fn row_level_classification() {
        assert!(BulkError::preprocess("bad object").is_row_level());
        assert!(BulkError::SchemaFrozen { column: "a".into() }.is_row_level());
        assert!(BulkError::SchemaConflict(TypeConflict {
            column: "a".into(),
            existing: DataKind::Int,
            incoming: DataKind::String,
        })
        .is_row_level());
        assert!(!BulkError::staging("flush", "disk full").is_row_level());
        assert!(!BulkError::load("copy", "timeout").is_row_level());
    }

    #[test]
    fn decorated_messages_keep_the_source() {
        let err = BulkError::load("failed to flush tmp file to the warehouse", "io timeout");
        assert_eq!(
            err.to_string(),
            "load failed: failed to flush tmp file to the warehouse: io timeout"
        );
    }
}
