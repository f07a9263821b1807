//! In-memory schema model for destination and staging tables.

use crate::value::{widen_with_policy, DataKind, TypeConflict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Column metadata: inferred kind plus an optional dialect-specific SQL
/// type annotation contributed by the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub kind: DataKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_type: Option<String>,
}

impl Column {
    pub fn new(kind: DataKind) -> Self {
        Self {
            kind,
            sql_type: None,
        }
    }

    pub fn with_sql_type(kind: DataKind, sql_type: impl Into<String>) -> Self {
        Self {
            kind,
            sql_type: Some(sql_type.into()),
        }
    }
}

/// Table descriptor.
///
/// Columns are keyed by sanitized name in a sorted map, so serialization
/// is ordered by name and equality is independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: BTreeMap<String, Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub temporary: bool,
}

/// Additive changes required to make one schema accept another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    /// Columns missing from the existing table.
    pub added_columns: BTreeMap<String, Column>,
    /// Columns whose type must be promoted, with the promoted column.
    pub widened_columns: BTreeMap<String, Column>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty() && self.widened_columns.is_empty()
    }
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adapters model a missing table as a descriptor with no columns.
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Column names in sorted order, the canonical header order for CSV
    /// batch files.
    pub fn sorted_column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    /// True iff every column of `self` exists in `target` with an equal or
    /// wider type, i.e. `target` accepts this schema without DDL.
    pub fn fits_to(&self, target: &Table) -> bool {
        self.columns.iter().all(|(name, col)| {
            target
                .columns
                .get(name)
                .is_some_and(|existing| col.kind.fits(existing.kind))
        })
    }

    /// Additive changes needed so that `existing` accepts `self`.
    ///
    /// Columns of `self` missing from `existing` land in `added_columns`;
    /// columns present in both but with a wider join land in
    /// `widened_columns`. Cross-branch joins follow the stream's
    /// stringification policy and error otherwise.
    pub fn diff(&self, existing: &Table, stringify: bool) -> Result<TableDiff, TypeConflict> {
        let mut diff = TableDiff::default();
        for (name, col) in &self.columns {
            match existing.columns.get(name) {
                None => {
                    diff.added_columns.insert(name.clone(), col.clone());
                }
                Some(prev) => {
                    let joined = widen_with_policy(name, prev.kind, col.kind, stringify)?;
                    if joined != prev.kind {
                        diff.widened_columns.insert(
                            name.clone(),
                            Column {
                                kind: joined,
                                sql_type: col.sql_type.clone(),
                            },
                        );
                    }
                }
            }
        }
        Ok(diff)
    }

    /// Column-wise union of two tables with widened types.
    ///
    /// `self`'s `sql_type` annotations win on ties, so destination
    /// annotations survive a merge with a freshly inferred schema.
    pub fn merge(&self, other: &Table, stringify: bool) -> Result<Table, TypeConflict> {
        let mut merged = self.clone();
        for (name, col) in &other.columns {
            match merged.columns.get_mut(name) {
                None => {
                    merged.columns.insert(name.clone(), col.clone());
                }
                Some(existing) => {
                    existing.kind = widen_with_policy(name, existing.kind, col.kind, stringify)?;
                    if existing.sql_type.is_none() {
                        existing.sql_type = col.sql_type.clone();
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Apply an already-computed diff to this table descriptor.
    pub fn apply_diff(&mut self, diff: &TableDiff) {
        for (name, col) in &diff.added_columns {
            self.columns.insert(name.clone(), col.clone());
        }
        for (name, col) in &diff.widened_columns {
            let entry = self
                .columns
                .entry(name.clone())
                .or_insert_with(|| col.clone());
            entry.kind = col.kind;
            if entry.sql_type.is_none() {
                entry.sql_type = col.sql_type.clone();
            }
        }
    }
}

/// Replace every run of characters outside `[A-Za-z0-9_]` with a single
/// underscore.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_replacement = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
            last_was_replacement = false;
        } else if !last_was_replacement {
            out.push('_');
            last_was_replacement = true;
        }
    }
    out
}
