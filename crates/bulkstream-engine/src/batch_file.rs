//! Local scratch file accumulating serialized events before load.
//!
//! Events append through the on-disk marshaller; for merge streams each
//! append records the line of the latest occurrence per primary key and
//! schedules earlier occurrences for omission. Finalizing rewrites the
//! file only when something forces it: scheduled skips, or an on-disk
//! format different from what the destination loads. The rewrite is a
//! single streaming pass.
//!
//! Whenever a rewrite may be needed the on-disk format is plain NDJSON
//! (the engine arranges marshallers so), which is what lets the rewrite
//! read the file line-by-line.

use crate::error::BulkError;
use bulkstream_types::{FileFormat, Marshaller, Object};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

pub struct BatchFile {
    scratch: NamedTempFile,
    marshaller: Box<dyn Marshaller>,
    target: Box<dyn Marshaller>,
    events: usize,
    marshaller_bound: bool,
    lines_by_pk: HashMap<String, usize>,
    skip_lines: BTreeSet<usize>,
}

/// A finalized batch file ready for load or upload. The temp file is
/// removed when this guard drops, so callers hold it across the load.
pub struct FlushedBatch {
    file: NamedTempFile,
    format: FileFormat,
    events: usize,
}

impl FlushedBatch {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn file_name(&self) -> String {
        self.file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn events(&self) -> usize {
        self.events
    }
}

impl BatchFile {
    pub fn new(
        prefix: &str,
        marshaller: Box<dyn Marshaller>,
        target: Box<dyn Marshaller>,
    ) -> Result<Self, BulkError> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{prefix}_"))
            .suffix(&marshaller.file_extension())
            .tempfile()
            .map_err(|e| BulkError::staging("failed to create batch file", e))?;
        Ok(Self {
            scratch,
            marshaller,
            target,
            events: 0,
            marshaller_bound: false,
            lines_by_pk: HashMap::new(),
            skip_lines: BTreeSet::new(),
        })
    }

    pub fn events(&self) -> usize {
        self.events
    }

    pub fn skip_lines(&self) -> &BTreeSet<usize> {
        &self.skip_lines
    }

    pub fn target_format(&self) -> FileFormat {
        self.target.format()
    }

    /// Append one object.
    ///
    /// `pk` enables merge bookkeeping: the previous line holding this
    /// key is scheduled for omission and the key now maps to the line
    /// being written. Line numbers account for a header line when the
    /// on-disk format carries one.
    pub fn append(
        &mut self,
        object: &Object,
        pk: Option<&str>,
        header: &[String],
    ) -> Result<(), BulkError> {
        if !self.marshaller_bound {
            let writer = self
                .scratch
                .as_file()
                .try_clone()
                .map_err(|e| BulkError::staging("failed to clone batch file handle", e))?;
            self.marshaller
                .init(Box::new(writer), header, None)
                .map_err(|e| BulkError::staging("failed to init batch file marshaller", e))?;
            self.marshaller_bound = true;
        }

        if let Some(pk) = pk {
            if let Some(&previous) = self.lines_by_pk.get(pk) {
                self.skip_lines.insert(previous);
            }
            let mut line = self.events;
            if self.marshaller.need_header() {
                line += 1;
            }
            self.lines_by_pk.insert(pk.to_string(), line);
        }

        self.marshaller
            .marshal(object)
            .map_err(|e| BulkError::staging("failed to marshal object into batch file", e))?;
        self.events += 1;
        Ok(())
    }

    /// Finalize: flush and sync the on-disk stream, then rewrite when a
    /// skip-set or format conversion demands it.
    pub fn finalize(
        mut self,
        header: &[String],
        avro_schema: Option<&Value>,
    ) -> Result<FlushedBatch, BulkError> {
        self.marshaller
            .flush()
            .map_err(|e| BulkError::staging("failed to flush batch file marshaller", e))?;
        self.scratch
            .as_file()
            .sync_all()
            .map_err(|e| BulkError::staging("failed to sync batch file", e))?;

        let need_convert = !self.target.equal(self.marshaller.as_ref());
        if self.skip_lines.is_empty() && !need_convert {
            let kept = self.events;
            return Ok(FlushedBatch {
                file: self.scratch,
                format: self.target.format(),
                events: kept,
            });
        }

        let base_name = self
            .scratch
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let working = tempfile::Builder::new()
            .prefix(&format!("{base_name}_"))
            .suffix(&self.target.file_extension())
            .tempfile()
            .map_err(|e| BulkError::staging("failed to create working batch file", e))?;

        if need_convert {
            let writer = working
                .as_file()
                .try_clone()
                .map_err(|e| BulkError::staging("failed to clone working file handle", e))?;
            self.target
                .init(Box::new(writer), header, avro_schema)
                .map_err(|e| BulkError::staging("failed to init converted batch file", e))?;
        }

        let source = std::fs::File::open(self.scratch.path())
            .map_err(|e| BulkError::staging("failed to reopen batch file", e))?;
        let reader = BufReader::new(source);
        let mut raw_out = working
            .as_file()
            .try_clone()
            .map_err(|e| BulkError::staging("failed to clone working file handle", e))?;

        let mut kept = 0usize;
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| BulkError::staging("failed to read batch file", e))?;
            if self.skip_lines.contains(&index) {
                continue;
            }
            if need_convert {
                let object: Object = serde_json::from_str(&line)
                    .map_err(|e| BulkError::staging("failed to decode batch file line", e))?;
                self.target
                    .marshal(&object)
                    .map_err(|e| BulkError::staging("failed to convert batch file line", e))?;
            } else {
                raw_out
                    .write_all(line.as_bytes())
                    .and_then(|()| raw_out.write_all(b"\n"))
                    .map_err(|e| BulkError::staging("failed to write deduplicated line", e))?;
            }
            kept += 1;
        }

        if need_convert {
            self.target
                .flush()
                .map_err(|e| BulkError::staging("failed to flush converted batch file", e))?;
        }
        working
            .as_file()
            .sync_all()
            .map_err(|e| BulkError::staging("failed to sync working batch file", e))?;

        debug!(
            events = self.events,
            kept,
            skipped = self.skip_lines.len(),
            converted = need_convert,
            "finalized batch file"
        );

        Ok(FlushedBatch {
            file: working,
            format: self.target.format(),
            events: kept,
        })
    }
}
