//! Value model, schema model, and batch-file marshallers for the
//! bulkstream load engine.
//!
//! This crate is the leaf of the workspace: it knows nothing about
//! adapters or stream lifecycles, only about dynamically typed event
//! objects, the table schemas induced from them, and how batches of them
//! are serialized to disk.

pub mod flatten;
pub mod marshaller;
pub mod schema;
pub mod table;
pub mod value;

pub use flatten::{flatten_object, FlattenError};
pub use marshaller::{
    new_marshaller, FileCompression, FileFormat, MarshalError, Marshaller,
};
pub use schema::induce_table;
pub use table::{sanitize_identifier, Column, Table, TableDiff};
pub use value::{
    infer_kind, reformat_time_value, widen, widen_with_policy, DataKind, Object, TypeConflict,
};
