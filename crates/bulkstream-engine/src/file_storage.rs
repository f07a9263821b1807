//! File-storage stream: no transaction and no tmp table. Events stage
//! into the batch file (with optional merge dedup) and the finalized
//! file uploads to the object-store sink at complete.

use crate::abstract_stream::StreamCore;
use crate::adapter::FileAdapter;
use crate::batch_file::BatchFile;
use crate::error::BulkError;
use crate::options::StreamOptions;
use crate::state::{StreamState, StreamStatus};
use crate::BulkLoadStream;
use async_trait::async_trait;
use bulkstream_types::{
    new_marshaller, sanitize_identifier, FileCompression, FileFormat, Object,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Produces the destination object name for one stream's batch.
pub type FilenameFunc = Box<dyn Fn() -> String + Send + Sync>;

pub struct FileStorageStream {
    core: StreamCore,
    adapter: Arc<dyn FileAdapter>,
    filename_func: FilenameFunc,
    batch_file: Option<BatchFile>,
    /// Union of keys seen across the stream; becomes the CSV header.
    csv_header: BTreeSet<String>,
}

impl FileStorageStream {
    pub(crate) fn new(
        id: &str,
        adapter: Arc<dyn FileAdapter>,
        filename_func: FilenameFunc,
        options: StreamOptions,
    ) -> Result<Self, BulkError> {
        let merge = options.merge_rows;
        if merge && options.primary_keys.is_empty() {
            return Err(BulkError::config(
                "merge_rows requires the primary_key option",
            ));
        }
        // Column-shaped targets need flat rows.
        let flatten = matches!(
            adapter.format(),
            FileFormat::Csv | FileFormat::FlatNdjson
        );
        let core = StreamCore::new(id, "", options, merge, flatten);
        Ok(Self {
            core,
            adapter,
            filename_func,
            batch_file: None,
            csv_header: BTreeSet::new(),
        })
    }

    fn init(&mut self) -> Result<(), BulkError> {
        if self.core.inited {
            return Ok(());
        }
        if self.batch_file.is_none() {
            let prefix = format!("bulkstream_{}", sanitize_identifier(&self.core.id));
            let on_disk = new_marshaller(FileFormat::Ndjson, FileCompression::None);
            let target = new_marshaller(self.adapter.format(), self.adapter.compression());
            self.batch_file = Some(BatchFile::new(&prefix, on_disk, target)?);
        }
        self.core.inited = true;
        Ok(())
    }

    fn consume_inner(&mut self, object: Object) -> Result<(), BulkError> {
        self.init()?;
        self.core.track_event_time(&object);
        let identity = |raw: &str| raw.to_string();
        let (_, processed) = self.core.preprocess(object, &identity)?;

        if self.adapter.format() == FileFormat::Csv {
            self.csv_header.extend(processed.keys().cloned());
        }
        let pk = if self.core.merge {
            Some(self.core.pk_value(&processed, &identity)?)
        } else {
            None
        };
        let batch = self
            .batch_file
            .as_mut()
            .ok_or_else(|| BulkError::staging("batch file", "stream has no staging file"))?;
        batch.append(&processed, pk.as_deref(), &[])
    }

    async fn flush_and_upload(&mut self) -> Result<(), BulkError> {
        let Some(batch) = self.batch_file.take() else {
            return Ok(());
        };
        if batch.events() == 0 {
            return Ok(());
        }
        let header: Vec<String> = self.csv_header.iter().cloned().collect();
        let avro_schema = if self.adapter.format() == FileFormat::Avro {
            self.adapter.avro_schema()
        } else {
            None
        };
        let flushed = batch.finalize(&header, avro_schema.as_ref())?;
        let name = (self.filename_func)();
        self.adapter.upload(&name, flushed.path()).await?;
        info!(
            stream = %self.core.id,
            object = %name,
            events = flushed.events(),
            "uploaded batch file"
        );
        Ok(())
    }
}

#[async_trait]
impl BulkLoadStream for FileStorageStream {
    async fn consume(&mut self, object: Object) -> (StreamState, Result<(), BulkError>) {
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        let result = self.consume_inner(object);
        // No transaction to poison, but a recorded error still fails
        // the upload at complete: the batch would be incomplete.
        let result = self.core.post_consume(result, true);
        (self.core.state.clone(), result)
    }

    async fn complete(&mut self) -> (StreamState, Result<(), BulkError>) {
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        let err = match self.core.last_error.clone() {
            Some(err) => Some(err),
            None => {
                if self.core.state.successful_rows > 0 {
                    self.flush_and_upload().await.err()
                } else {
                    None
                }
            }
        };
        self.batch_file = None;
        if err.is_some() {
            self.core.state.successful_rows = 0;
        }
        self.core.post_complete(err)
    }

    async fn abort(&mut self) -> (StreamState, Result<(), BulkError>) {
        if self.core.state.status == StreamStatus::Aborted {
            return (self.core.state.clone(), Ok(()));
        }
        if let Err(err) = self.core.check_active() {
            return (self.core.state.clone(), Err(err));
        }
        self.batch_file = None;
        self.core.state.status = StreamStatus::Aborted;
        (self.core.state.clone(), Ok(()))
    }
}
