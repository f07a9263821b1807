//! Schema induction: derive a candidate table from a single event object.

use crate::table::{Column, Table};
use crate::value::{infer_kind, Object};

/// Build a candidate [`Table`] from one object.
///
/// Column kinds are inferred per value; the object's keys are assumed
/// already sanitized (preprocessing flattens and maps names before
/// induction). Primary keys and the partition key are attached verbatim;
/// PK columns absent from the object are declared with an `Unknown` kind
/// so the invariant that PK columns exist always holds.
pub fn induce_table(
    name: &str,
    object: &Object,
    primary_keys: &[String],
    partition_key: Option<&str>,
) -> Table {
    let mut table = Table::new(name);
    for (column, value) in object {
        table
            .columns
            .insert(column.clone(), Column::new(infer_kind(value)));
    }
    for pk in primary_keys {
        table
            .columns
            .entry(pk.clone())
            .or_insert_with(|| Column::new(crate::value::DataKind::Unknown));
    }
    table.primary_keys = primary_keys.to_vec();
    table.partition_key = partition_key.map(ToString::to_string);
    table
}
