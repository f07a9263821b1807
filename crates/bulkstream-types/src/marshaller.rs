//! Pluggable batch-file writers.
//!
//! A [`Marshaller`] owns the byte stream of one batch file: NDJSON (the
//! engine's working format), flattened NDJSON, CSV with a sorted header,
//! or Avro with a destination-supplied schema. Compression is layered
//! under the codec and finalized by [`Marshaller::flush`], which must be
//! idempotent because cleanup paths may flush again.

use crate::flatten::{flatten_object, FlattenError};
use crate::value::Object;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{self, BufWriter, Write};

/// Batch file serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Ndjson,
    FlatNdjson,
    Csv,
    Avro,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Ndjson | Self::FlatNdjson => ".ndjson",
            Self::Csv => ".csv",
            Self::Avro => ".avro",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ndjson => "ndjson",
            Self::FlatNdjson => "flat_ndjson",
            Self::Csv => "csv",
            Self::Avro => "avro",
        };
        f.write_str(s)
    }
}

/// Batch file compression codec.
///
/// Avro is excluded: its container manages an internal codec, so the
/// Avro marshaller always reports `None` here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCompression {
    #[default]
    None,
    Zstd,
}

impl FileCompression {
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Zstd => ".zst",
        }
    }
}

/// Marshalling failure.
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("batch file io failed: {0}")]
    Io(#[from] io::Error),
    #[error("csv encoding failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("avro encoding failed: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Flatten(#[from] FlattenError),
    #[error("avro batch files require a schema at init")]
    MissingAvroSchema,
    #[error("marshaller is already finalized")]
    Finalized,
}

/// Writer over one batch file.
pub trait Marshaller: Send {
    /// Bind the marshaller to an output stream and emit the header or
    /// schema preamble if the format needs one. Subsequent calls are
    /// no-ops, so the append path can call this per object.
    fn init(
        &mut self,
        writer: Box<dyn Write + Send>,
        header: &[String],
        avro_schema: Option<&Value>,
    ) -> Result<(), MarshalError>;

    /// Append one object.
    fn marshal(&mut self, object: &Object) -> Result<(), MarshalError>;

    /// Finalize the stream, including any compression footer. Idempotent;
    /// the marshaller accepts no writes afterwards.
    fn flush(&mut self) -> Result<(), MarshalError>;

    fn format(&self) -> FileFormat;

    fn compression(&self) -> FileCompression;

    /// Whether line 0 of the file is a header rather than an event.
    fn need_header(&self) -> bool;

    /// File extension including the compression suffix.
    fn file_extension(&self) -> String {
        format!(
            "{}{}",
            self.format().extension(),
            self.compression().extension()
        )
    }

    /// Two marshallers produce interchangeable files iff format and
    /// compression match.
    fn equal(&self, other: &dyn Marshaller) -> bool {
        self.format() == other.format() && self.compression() == other.compression()
    }
}

/// Construct the marshaller for a format/compression pair.
pub fn new_marshaller(
    format: FileFormat,
    compression: FileCompression,
) -> Box<dyn Marshaller> {
    match format {
        FileFormat::Ndjson => Box::new(JsonMarshaller::new(false, compression)),
        FileFormat::FlatNdjson => Box::new(JsonMarshaller::new(true, compression)),
        FileFormat::Csv => Box::new(CsvMarshaller::new(compression)),
        FileFormat::Avro => Box::new(AvroMarshaller::new()),
    }
}

// ── Compressed sink ─────────────────────────────────────────────────

enum SinkWriter {
    Plain(BufWriter<Box<dyn Write + Send>>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<Box<dyn Write + Send>>>),
}

impl SinkWriter {
    fn new(writer: Box<dyn Write + Send>, compression: FileCompression) -> io::Result<Self> {
        let buffered = BufWriter::new(writer);
        match compression {
            FileCompression::None => Ok(Self::Plain(buffered)),
            FileCompression::Zstd => Ok(Self::Zstd(zstd::stream::write::Encoder::new(
                buffered, 0,
            )?)),
        }
    }

    /// Flush buffers and write the compression footer.
    fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Zstd(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}

// ── NDJSON ──────────────────────────────────────────────────────────

/// Newline-delimited JSON, optionally flattening each object pre-marshal.
pub struct JsonMarshaller {
    flatten: bool,
    compression: FileCompression,
    writer: Option<SinkWriter>,
    finalized: bool,
}

impl JsonMarshaller {
    pub fn new(flatten: bool, compression: FileCompression) -> Self {
        Self {
            flatten,
            compression,
            writer: None,
            finalized: false,
        }
    }
}

impl Marshaller for JsonMarshaller {
    fn init(
        &mut self,
        writer: Box<dyn Write + Send>,
        _header: &[String],
        _avro_schema: Option<&Value>,
    ) -> Result<(), MarshalError> {
        if self.finalized {
            return Err(MarshalError::Finalized);
        }
        if self.writer.is_none() {
            self.writer = Some(SinkWriter::new(writer, self.compression)?);
        }
        Ok(())
    }

    fn marshal(&mut self, object: &Object) -> Result<(), MarshalError> {
        let writer = self.writer.as_mut().ok_or(MarshalError::Finalized)?;
        if self.flatten {
            let flat = flatten_object(object)?;
            serde_json::to_writer(&mut *writer, &flat)?;
        } else {
            serde_json::to_writer(&mut *writer, object)?;
        }
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MarshalError> {
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
        }
        self.finalized = true;
        Ok(())
    }

    fn format(&self) -> FileFormat {
        if self.flatten {
            FileFormat::FlatNdjson
        } else {
            FileFormat::Ndjson
        }
    }

    fn compression(&self) -> FileCompression {
        self.compression
    }

    fn need_header(&self) -> bool {
        false
    }
}

// ── CSV ─────────────────────────────────────────────────────────────

/// CSV with a header row; column order is the sorted column set fixed at
/// init. Missing keys serialize empty, unlisted keys are dropped.
pub struct CsvMarshaller {
    compression: FileCompression,
    writer: Option<csv::Writer<SinkWriter>>,
    fields: Vec<String>,
    finalized: bool,
}

impl CsvMarshaller {
    pub fn new(compression: FileCompression) -> Self {
        Self {
            compression,
            writer: None,
            fields: Vec::new(),
            finalized: false,
        }
    }

    fn render(value: Option<&Value>) -> String {
        match value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl Marshaller for CsvMarshaller {
    fn init(
        &mut self,
        writer: Box<dyn Write + Send>,
        header: &[String],
        _avro_schema: Option<&Value>,
    ) -> Result<(), MarshalError> {
        if self.finalized {
            return Err(MarshalError::Finalized);
        }
        if self.writer.is_none() {
            let sink = SinkWriter::new(writer, self.compression)?;
            let mut csv_writer = csv::WriterBuilder::new().from_writer(sink);
            csv_writer.write_record(header)?;
            self.fields = header.to_vec();
            self.writer = Some(csv_writer);
        }
        Ok(())
    }

    fn marshal(&mut self, object: &Object) -> Result<(), MarshalError> {
        let writer = self.writer.as_mut().ok_or(MarshalError::Finalized)?;
        let record: Vec<String> = self
            .fields
            .iter()
            .map(|field| Self::render(object.get(field)))
            .collect();
        writer.write_record(&record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MarshalError> {
        if let Some(writer) = self.writer.take() {
            let sink = writer
                .into_inner()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            sink.finish()?;
        }
        self.finalized = true;
        Ok(())
    }

    fn format(&self) -> FileFormat {
        FileFormat::Csv
    }

    fn compression(&self) -> FileCompression {
        self.compression
    }

    fn need_header(&self) -> bool {
        true
    }
}

// ── Avro ────────────────────────────────────────────────────────────

/// Avro object container file. Records are buffered and written on
/// flush because the container writer borrows the schema for its whole
/// lifetime.
pub struct AvroMarshaller {
    schema: Option<apache_avro::Schema>,
    out: Option<Box<dyn Write + Send>>,
    buffered: Vec<Object>,
    finalized: bool,
}

impl AvroMarshaller {
    pub fn new() -> Self {
        Self {
            schema: None,
            out: None,
            buffered: Vec::new(),
            finalized: false,
        }
    }
}

impl Default for AvroMarshaller {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshaller for AvroMarshaller {
    fn init(
        &mut self,
        writer: Box<dyn Write + Send>,
        _header: &[String],
        avro_schema: Option<&Value>,
    ) -> Result<(), MarshalError> {
        if self.finalized {
            return Err(MarshalError::Finalized);
        }
        if self.out.is_none() {
            let schema_json = avro_schema.ok_or(MarshalError::MissingAvroSchema)?;
            self.schema = Some(apache_avro::Schema::parse_str(&schema_json.to_string())?);
            self.out = Some(writer);
        }
        Ok(())
    }

    fn marshal(&mut self, object: &Object) -> Result<(), MarshalError> {
        if self.out.is_none() {
            return Err(MarshalError::Finalized);
        }
        self.buffered.push(object.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MarshalError> {
        if let (Some(schema), Some(out)) = (self.schema.take(), self.out.take()) {
            let mut writer = apache_avro::Writer::new(&schema, out);
            for object in self.buffered.drain(..) {
                // Maps resolve into records against the container schema.
                let value = apache_avro::to_value(&object)?.resolve(&schema)?;
                writer.append(value)?;
            }
            let mut out = writer.into_inner()?;
            out.flush()?;
        }
        self.finalized = true;
        Ok(())
    }

    fn format(&self) -> FileFormat {
        FileFormat::Avro
    }

    fn compression(&self) -> FileCompression {
        FileCompression::None
    }

    fn need_header(&self) -> bool {
        false
    }
}
