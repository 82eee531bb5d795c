use std::fmt::{Display, Formatter};
use std::str::FromStr;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

pub use encode::{avro_schema_for, encode_batch};
pub use location::{open_location, parse_location, StoreKind, StoreLocation};
pub use object_store_sink::ObjectStoreSink;

use crate::AppResult;

mod encode;
mod location;
mod object_store_sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Parquet,
    Json,
    Csv,
    Avro,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "snappy.parquet",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Avro => "avro",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parquet" => Ok(OutputFormat::Parquet),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "avro" => Ok(OutputFormat::Avro),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Avro => "avro",
        };
        write!(f, "{}", name)
    }
}

/// How a batch treats data already present at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    Append,
    Overwrite,
    ErrorIfExists,
    Ignore,
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(WriteMode::Append),
            "overwrite" => Ok(WriteMode::Overwrite),
            "errorifexists" | "error" | "default" => Ok(WriteMode::ErrorIfExists),
            "ignore" => Ok(WriteMode::Ignore),
            other => Err(format!("unknown write mode: {}", other)),
        }
    }
}

impl Display for WriteMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriteMode::Append => "append",
            WriteMode::Overwrite => "overwrite",
            WriteMode::ErrorIfExists => "errorifexists",
            WriteMode::Ignore => "ignore",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// `ignore` mode found existing data and left it alone.
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub location: String,
    pub format: OutputFormat,
    pub mode: WriteMode,
    pub rows_written: usize,
    pub files: Vec<String>,
    pub outcome: WriteOutcome,
}

/// Destination of decoded batches. `write` returns only once the data is
/// stored; any error leaves the batch uncommitted.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn write(
        &self,
        rows: &RecordBatch,
        format: OutputFormat,
        mode: WriteMode,
    ) -> AppResult<WriteResult>;
}
