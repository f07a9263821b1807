//! Recursive flattening of nested event objects into column-shaped rows.

use crate::table::sanitize_identifier;
use crate::value::Object;
use serde_json::Value;

/// Flattening failure: two distinct source keys collapsed onto the same
/// sanitized column name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("flattening produced duplicate column '{column}'")]
pub struct FlattenError {
    pub column: String,
}

/// Flatten a nested object into a single-level map.
///
/// Nested object keys are concatenated with `_`, arrays become JSON text
/// leaves, and every key is sanitized to `[A-Za-z0-9_]+`. Flat input
/// passes through unchanged, so the operation is idempotent.
pub fn flatten_object(object: &Object) -> Result<Object, FlattenError> {
    let mut out = Object::new();
    flatten_into(&mut out, "", object)?;
    Ok(out)
}

fn flatten_into(out: &mut Object, prefix: &str, object: &Object) -> Result<(), FlattenError> {
    for (key, value) in object {
        let sanitized = sanitize_identifier(key);
        let column = if prefix.is_empty() {
            sanitized
        } else {
            format!("{prefix}_{sanitized}")
        };
        match value {
            Value::Object(nested) => flatten_into(out, &column, nested)?,
            Value::Array(_) => {
                // Arrays are leaves: their JSON text lands in one column.
                let text = serde_json::to_string(value).unwrap_or_default();
                insert_unique(out, column, Value::String(text))?;
            }
            other => insert_unique(out, column, other.clone())?,
        }
    }
    Ok(())
}

fn insert_unique(out: &mut Object, column: String, value: Value) -> Result<(), FlattenError> {
    if out.contains_key(&column) {
        return Err(FlattenError { column });
    }
    out.insert(column, value);
    Ok(())
}
