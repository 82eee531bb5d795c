//! Turns raw log records into typed rows.
//!
//! The decoder is picked once from the configured message format (and its
//! schema, for structured formats) and reused for every batch. Every decoded
//! table starts with a nullable `key` column; the value columns depend on the
//! format.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{ArrayRef, BinaryBuilder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tracing::info;

pub use avro::AvroDecoder;
pub use json::JsonDecoder;
pub use schema::{fetch_schema_text, parse_avro_schema, parse_struct_type};

use crate::message::{Batch, RawRecord};
use crate::{AppError, AppResult};

mod avro;
mod json;
mod schema;

pub const KEY_COLUMN: &str = "key";
pub const VALUE_COLUMN: &str = "value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageFormat {
    /// value as UTF-8 text
    Raw,
    /// value as opaque binary
    Bytes,
    Json,
    Avro,
}

impl MessageFormat {
    pub fn requires_schema(&self) -> bool {
        matches!(self, MessageFormat::Json | MessageFormat::Avro)
    }
}

impl FromStr for MessageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "string" => Ok(MessageFormat::Raw),
            "bytes" | "binary" => Ok(MessageFormat::Bytes),
            "json" => Ok(MessageFormat::Json),
            "avro" => Ok(MessageFormat::Avro),
            other => Err(format!("unknown message format: {}", other)),
        }
    }
}

impl Display for MessageFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageFormat::Raw => "raw",
            MessageFormat::Bytes => "bytes",
            MessageFormat::Json => "json",
            MessageFormat::Avro => "avro",
        };
        write!(f, "{}", name)
    }
}

/// A message format bound to its resolved schema.
#[derive(Debug, Clone)]
pub enum RecordDecoder {
    Raw,
    Bytes,
    Json(JsonDecoder),
    Avro(AvroDecoder),
}

impl RecordDecoder {
    /// Resolves the schema of structured formats from `schema_url`.
    pub async fn resolve(format: MessageFormat, schema_url: Option<&str>) -> AppResult<Self> {
        match format {
            MessageFormat::Raw => Ok(RecordDecoder::Raw),
            MessageFormat::Bytes => Ok(RecordDecoder::Bytes),
            MessageFormat::Json | MessageFormat::Avro => {
                let url = schema_url.ok_or_else(|| {
                    AppError::SchemaResolution(format!(
                        "{} format requires a schema reference",
                        format
                    ))
                })?;
                let text = fetch_schema_text(url).await?;
                let decoder = Self::with_schema(format, &text)?;
                info!(
                    "resolved {} schema from {} with {} value columns",
                    format,
                    url,
                    decoder.output_schema().fields().len() - 1
                );
                Ok(decoder)
            }
        }
    }

    pub fn with_schema(format: MessageFormat, schema_text: &str) -> AppResult<Self> {
        match format {
            MessageFormat::Raw => Ok(RecordDecoder::Raw),
            MessageFormat::Bytes => Ok(RecordDecoder::Bytes),
            MessageFormat::Json => Ok(RecordDecoder::Json(JsonDecoder::new(parse_struct_type(
                schema_text,
            )?))),
            MessageFormat::Avro => {
                let (writer_schema, value_schema) = parse_avro_schema(schema_text)?;
                Ok(RecordDecoder::Avro(AvroDecoder::new(
                    writer_schema,
                    value_schema,
                )))
            }
        }
    }

    pub fn format(&self) -> MessageFormat {
        match self {
            RecordDecoder::Raw => MessageFormat::Raw,
            RecordDecoder::Bytes => MessageFormat::Bytes,
            RecordDecoder::Json(_) => MessageFormat::Json,
            RecordDecoder::Avro(_) => MessageFormat::Avro,
        }
    }

    pub fn output_schema(&self) -> SchemaRef {
        match self {
            RecordDecoder::Raw => single_value_schema(DataType::Utf8),
            RecordDecoder::Bytes => single_value_schema(DataType::Binary),
            RecordDecoder::Json(decoder) => with_key_field(decoder.value_schema()),
            RecordDecoder::Avro(decoder) => with_key_field(decoder.value_schema()),
        }
    }

    /// Decodes all records or none: the first bad record fails the batch.
    pub fn decode(&self, records: &[RawRecord]) -> AppResult<RecordBatch> {
        let mut columns = Vec::with_capacity(self.output_schema().fields().len());
        columns.push(key_column(records)?);
        match self {
            RecordDecoder::Raw => {
                let mut builder = StringBuilder::with_capacity(records.len(), 0);
                for record in records {
                    builder.append_value(utf8(record, &record.value, "value")?);
                }
                columns.push(Arc::new(builder.finish()));
            }
            RecordDecoder::Bytes => {
                let mut builder = BinaryBuilder::with_capacity(records.len(), 0);
                for record in records {
                    builder.append_value(&record.value);
                }
                columns.push(Arc::new(builder.finish()));
            }
            RecordDecoder::Json(decoder) => columns.extend(decoder.decode(records)?),
            RecordDecoder::Avro(decoder) => columns.extend(decoder.decode(records)?),
        }
        RecordBatch::try_new(self.output_schema(), columns)
            .map_err(|err| AppError::IllegalStateError(format!("decoded columns: {}", err)))
    }
}

pub fn decode(batch: &Batch, decoder: &RecordDecoder) -> AppResult<RecordBatch> {
    decoder.decode(batch.records())
}

fn key_field() -> Field {
    Field::new(KEY_COLUMN, DataType::Utf8, true)
}

fn single_value_schema(value_type: DataType) -> SchemaRef {
    Arc::new(Schema::new(vec![
        key_field(),
        Field::new(VALUE_COLUMN, value_type, false),
    ]))
}

fn with_key_field(value_schema: &SchemaRef) -> SchemaRef {
    let mut fields = Vec::with_capacity(value_schema.fields().len() + 1);
    fields.push(Arc::new(key_field()));
    fields.extend(value_schema.fields().iter().cloned());
    Arc::new(Schema::new(fields))
}

fn key_column(records: &[RawRecord]) -> AppResult<ArrayRef> {
    let mut builder = StringBuilder::with_capacity(records.len(), 0);
    for record in records {
        match &record.key {
            Some(key) => builder.append_value(utf8(record, key, "key")?),
            None => builder.append_null(),
        }
    }
    Ok(Arc::new(builder.finish()))
}

fn utf8<'a>(record: &RawRecord, bytes: &'a [u8], what: &str) -> AppResult<&'a str> {
    std::str::from_utf8(bytes)
        .map_err(|err| decode_error(record, format!("{} is not valid UTF-8: {}", what, err)))
}

pub(crate) fn decode_error(record: &RawRecord, reason: impl Display) -> AppError {
    AppError::Decode {
        partition: record.partition,
        offset: record.offset,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, BinaryArray, StringArray};
    use bytes::Bytes;
    use rstest::rstest;

    fn record(offset: i64, key: Option<&str>, value: &[u8]) -> RawRecord {
        RawRecord::new(
            0,
            offset,
            key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            Bytes::copy_from_slice(value),
        )
    }

    #[rstest]
    #[case("raw", MessageFormat::Raw)]
    #[case("STRING", MessageFormat::Raw)]
    #[case("bytes", MessageFormat::Bytes)]
    #[case("Json", MessageFormat::Json)]
    #[case("avro", MessageFormat::Avro)]
    fn parse_message_format(#[case] input: &str, #[case] expected: MessageFormat) {
        assert_eq!(input.parse::<MessageFormat>().unwrap(), expected);
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!("protobuf".parse::<MessageFormat>().is_err());
    }

    #[test]
    fn raw_keeps_every_record() {
        let records = vec![
            record(10, Some("a"), b"v1"),
            record(11, Some("b"), b"v2"),
            record(12, None, b"v3"),
        ];
        let rows = RecordDecoder::Raw.decode(&records).unwrap();
        assert_eq!(rows.num_rows(), records.len());

        let keys = rows
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let values = rows
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(keys.value(0), "a");
        assert_eq!(values.value(1), "v2");
        assert!(keys.is_null(2));
        assert_eq!(values.value(2), "v3");
    }

    #[test]
    fn raw_rejects_invalid_utf8() {
        let records = vec![record(5, None, &[0xff, 0xfe])];
        match RecordDecoder::Raw.decode(&records) {
            Err(AppError::Decode { offset, .. }) => assert_eq!(offset, 5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bytes_passes_value_through() {
        let records = vec![record(0, Some("k"), &[0, 159, 146, 150])];
        let rows = RecordDecoder::Bytes.decode(&records).unwrap();
        let values = rows
            .column(1)
            .as_any()
            .downcast_ref::<BinaryArray>()
            .unwrap();
        assert_eq!(values.value(0), &[0, 159, 146, 150]);
        assert_eq!(rows.schema().field(1).data_type(), &DataType::Binary);
    }

    #[test]
    fn empty_input_yields_empty_table() {
        let rows = RecordDecoder::Raw.decode(&[]).unwrap();
        assert_eq!(rows.num_rows(), 0);
        assert_eq!(rows.num_columns(), 2);
    }

    #[test]
    fn decoding_is_deterministic() {
        let decoder = RecordDecoder::with_schema(
            MessageFormat::Json,
            r#"{"fields":[{"name":"id","type":"long"},{"name":"name","type":"string"}]}"#,
        )
        .unwrap();
        let records = vec![
            record(0, Some("a"), br#"{"id":1,"name":"x"}"#),
            record(1, None, br#"{"id":2}"#),
        ];
        let first = decoder.decode(&records).unwrap();
        let second = decoder.decode(&records).unwrap();
        assert_eq!(first, second);

        let raw_first = RecordDecoder::Raw.decode(&records).unwrap();
        let raw_second = RecordDecoder::Raw.decode(&records).unwrap();
        assert_eq!(raw_first, raw_second);
    }

    #[tokio::test]
    async fn structured_format_without_schema_fails() {
        let result = RecordDecoder::resolve(MessageFormat::Json, None).await;
        assert!(matches!(result, Err(AppError::SchemaResolution(_))));
    }

    #[tokio::test]
    async fn resolve_reads_schema_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        tokio::fs::write(&path, r#"{"fields":[{"name":"id","type":"long"}]}"#)
            .await
            .unwrap();

        let decoder = RecordDecoder::resolve(MessageFormat::Json, path.to_str())
            .await
            .unwrap();
        // the schema file is no longer needed once resolved
        tokio::fs::remove_file(&path).await.unwrap();

        let rows = decoder.decode(&[record(0, None, br#"{"id":7}"#)]).unwrap();
        assert_eq!(rows.num_rows(), 1);
        assert_eq!(decoder.format(), MessageFormat::Json);
    }
}
