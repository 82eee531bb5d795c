use std::sync::Arc;

use apache_avro::schema::Schema as AvroSchema;
use apache_avro::types::Value;
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Float32Builder, Float64Builder, Int32Builder,
    Int64Builder, StringBuilder,
};
use arrow::datatypes::{DataType, SchemaRef};

use super::decode_error;
use crate::message::RawRecord;
use crate::{AppError, AppResult};

/// Decodes single Avro binary datums (no container header, no registry
/// framing) written with a known record schema.
#[derive(Debug, Clone)]
pub struct AvroDecoder {
    writer_schema: AvroSchema,
    value_schema: SchemaRef,
}

impl AvroDecoder {
    pub fn new(writer_schema: AvroSchema, value_schema: SchemaRef) -> Self {
        AvroDecoder {
            writer_schema,
            value_schema,
        }
    }

    pub fn value_schema(&self) -> &SchemaRef {
        &self.value_schema
    }

    pub fn decode(&self, records: &[RawRecord]) -> AppResult<Vec<ArrayRef>> {
        let mut builders = self
            .value_schema
            .fields()
            .iter()
            .map(|field| ColumnBuilder::new(field.data_type(), records.len()))
            .collect::<AppResult<Vec<_>>>()?;

        for record in records {
            let mut reader: &[u8] = &record.value;
            let datum = apache_avro::from_avro_datum(&self.writer_schema, &mut reader, None)
                .map_err(|err| decode_error(record, err))?;
            if !reader.is_empty() {
                return Err(decode_error(
                    record,
                    format!("{} trailing bytes after avro datum", reader.len()),
                ));
            }
            let fields = match datum {
                Value::Record(fields) if fields.len() == builders.len() => fields,
                _ => return Err(decode_error(record, "datum does not match the record schema")),
            };
            for ((name, value), (builder, field)) in fields
                .into_iter()
                .zip(builders.iter_mut().zip(self.value_schema.fields()))
            {
                builder
                    .append(value, field.is_nullable())
                    .map_err(|reason| decode_error(record, format!("field {}: {}", name, reason)))?;
            }
        }

        Ok(builders.into_iter().map(ColumnBuilder::finish).collect())
    }
}

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Binary(BinaryBuilder),
    Utf8(StringBuilder),
}

impl ColumnBuilder {
    fn new(data_type: &DataType, capacity: usize) -> AppResult<Self> {
        let builder = match data_type {
            DataType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            DataType::Int32 => ColumnBuilder::Int32(Int32Builder::with_capacity(capacity)),
            DataType::Int64 => ColumnBuilder::Int64(Int64Builder::with_capacity(capacity)),
            DataType::Float32 => ColumnBuilder::Float32(Float32Builder::with_capacity(capacity)),
            DataType::Float64 => ColumnBuilder::Float64(Float64Builder::with_capacity(capacity)),
            DataType::Binary => ColumnBuilder::Binary(BinaryBuilder::with_capacity(capacity, 0)),
            DataType::Utf8 => ColumnBuilder::Utf8(StringBuilder::with_capacity(capacity, 0)),
            other => {
                return Err(AppError::SchemaResolution(format!(
                    "unsupported avro column type {}",
                    other
                )))
            }
        };
        Ok(builder)
    }

    fn append(&mut self, value: Value, nullable: bool) -> Result<(), String> {
        let value = match value {
            Value::Union(_, inner) => *inner,
            other => other,
        };
        if let Value::Null = value {
            if !nullable {
                return Err("null in a non-nullable field".to_string());
            }
            self.append_null();
            return Ok(());
        }
        match (self, value) {
            (ColumnBuilder::Boolean(b), Value::Boolean(v)) => b.append_value(v),
            (ColumnBuilder::Int32(b), Value::Int(v)) => b.append_value(v),
            (ColumnBuilder::Int64(b), Value::Long(v)) => b.append_value(v),
            (ColumnBuilder::Float32(b), Value::Float(v)) => b.append_value(v),
            (ColumnBuilder::Float64(b), Value::Double(v)) => b.append_value(v),
            (ColumnBuilder::Binary(b), Value::Bytes(v)) => b.append_value(v),
            (ColumnBuilder::Utf8(b), Value::String(v)) => b.append_value(v),
            (_, other) => return Err(format!("unexpected value {:?}", other)),
        }
        Ok(())
    }

    fn append_null(&mut self) {
        match self {
            ColumnBuilder::Boolean(b) => b.append_null(),
            ColumnBuilder::Int32(b) => b.append_null(),
            ColumnBuilder::Int64(b) => b.append_null(),
            ColumnBuilder::Float32(b) => b.append_null(),
            ColumnBuilder::Float64(b) => b.append_null(),
            ColumnBuilder::Binary(b) => b.append_null(),
            ColumnBuilder::Utf8(b) => b.append_null(),
        }
    }

    fn finish(self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int32(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Float32(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Binary(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(mut b) => Arc::new(b.finish()),
        }
    }
}
