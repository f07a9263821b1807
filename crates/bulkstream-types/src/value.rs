//! Dynamic value typing for incoming event objects.
//!
//! Events arrive as JSON maps with no declared schema; the engine infers a
//! [`DataKind`] per column and widens it monotonically as more values are
//! seen. The kind lattice is a chain `Unknown < Bool < Int < Float < String`
//! with `Timestamp` and `Bytes` as siblings of `String`: joins inside the
//! chain are free, every cross-branch join is a conflict that may only be
//! resolved by stringification when the stream opts into it.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A single semi-structured event: column name to dynamically typed value.
pub type Object = serde_json::Map<String, Value>;

/// Inferred column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Only null values seen so far; widens to any concrete kind for free.
    Unknown,
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    Bytes,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Timestamp => "timestamp",
            Self::Bytes => "bytes",
        };
        f.write_str(s)
    }
}

impl DataKind {
    /// Position in the `Unknown < Bool < Int < Float < String` chain, or
    /// `None` for the sibling branches.
    fn chain_rank(self) -> Option<u8> {
        match self {
            Self::Unknown => Some(0),
            Self::Bool => Some(1),
            Self::Int => Some(2),
            Self::Float => Some(3),
            Self::String => Some(4),
            Self::Timestamp | Self::Bytes => None,
        }
    }

    /// True if a value of `self` is accepted by a column of `target`
    /// without widening.
    pub fn fits(self, target: DataKind) -> bool {
        if self == target || self == Self::Unknown {
            return true;
        }
        match (self.chain_rank(), target.chain_rank()) {
            (Some(a), Some(b)) => a <= b,
            // The sibling branches only accept themselves.
            _ => false,
        }
    }
}

/// Incompatible type change for a column.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("incompatible types for column '{column}': {existing} vs {incoming}")]
pub struct TypeConflict {
    pub column: String,
    pub existing: DataKind,
    pub incoming: DataKind,
}

/// Least upper bound of two kinds, `None` when the join is a conflict.
///
/// Joins within the chain are free (`Int ⊔ Float = Float`); a column never
/// narrows, so a `Float` column absorbing an `Int` value stays `Float`.
/// `Timestamp` and `Bytes` join only with themselves and `Unknown`.
pub fn widen(a: DataKind, b: DataKind) -> Option<DataKind> {
    if a == b {
        return Some(a);
    }
    if a == DataKind::Unknown {
        return Some(b);
    }
    if b == DataKind::Unknown {
        return Some(a);
    }
    match (a.chain_rank(), b.chain_rank()) {
        (Some(ra), Some(rb)) => {
            let (hi, hi_rank) = if ra >= rb { (a, ra) } else { (b, rb) };
            // The jump to String is not free; it is the stringify fallback.
            if hi_rank == 4 {
                None
            } else {
                Some(hi)
            }
        }
        _ => None,
    }
}

/// Directional widening with the stream's conflict policy applied.
///
/// A value that already fits the existing column changes nothing: an
/// int landing in a string column is the column staying string, not a
/// string promotion. Otherwise the join applies; a conflicting join
/// degrades to `String` when `stringify` is set and errors otherwise.
pub fn widen_with_policy(
    column: &str,
    existing: DataKind,
    incoming: DataKind,
    stringify: bool,
) -> Result<DataKind, TypeConflict> {
    if incoming.fits(existing) {
        return Ok(existing);
    }
    match widen(existing, incoming) {
        Some(kind) => Ok(kind),
        None if stringify => Ok(DataKind::String),
        None => Err(TypeConflict {
            column: column.to_string(),
            existing,
            incoming,
        }),
    }
}

/// Infer the kind of a single JSON value.
///
/// Strings that parse as RFC 3339 timestamps are classified as
/// `Timestamp`; arrays and nested objects (possible only before
/// flattening) classify as `String` since they are serialized as JSON
/// text on the way to a column.
pub fn infer_kind(value: &Value) -> DataKind {
    match value {
        Value::Null => DataKind::Unknown,
        Value::Bool(_) => DataKind::Bool,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                DataKind::Int
            } else {
                DataKind::Float
            }
        }
        Value::String(s) => {
            if DateTime::parse_from_rfc3339(s).is_ok() {
                DataKind::Timestamp
            } else {
                DataKind::String
            }
        }
        Value::Array(_) | Value::Object(_) => DataKind::String,
    }
}

/// Interpret a value as an event timestamp: RFC 3339 strings and integer
/// epoch milliseconds are accepted, everything else is `None`.
pub fn reformat_time_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
