use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    Schema, TimeUnit, TimestampMicrosecondType,
};
use arrow::record_batch::RecordBatch;
use apache_avro::types::Value;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::json;

use super::OutputFormat;
use crate::{AppError, AppResult};

/// Serializes a decoded batch into the bytes of one output file.
pub fn encode_batch(rows: &RecordBatch, format: OutputFormat) -> AppResult<Vec<u8>> {
    match format {
        OutputFormat::Parquet => encode_parquet(rows),
        OutputFormat::Json => encode_json(rows),
        OutputFormat::Csv => encode_csv(rows),
        OutputFormat::Avro => encode_avro(rows),
    }
}

fn write_failure(format: OutputFormat, err: impl std::fmt::Display) -> AppError {
    AppError::WriteFailure(format!("encoding {} file: {}", format, err))
}

fn encode_parquet(rows: &RecordBatch) -> AppResult<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let fail = |err| write_failure(OutputFormat::Parquet, err);
    let mut writer = ArrowWriter::try_new(Vec::new(), rows.schema(), Some(props)).map_err(fail)?;
    writer.write(rows).map_err(fail)?;
    writer.into_inner().map_err(fail)
}

fn encode_json(rows: &RecordBatch) -> AppResult<Vec<u8>> {
    let fail = |err| write_failure(OutputFormat::Json, err);
    let mut writer = arrow_json::LineDelimitedWriter::new(Vec::new());
    writer.write(rows).map_err(fail)?;
    writer.finish().map_err(fail)?;
    Ok(writer.into_inner())
}

fn encode_csv(rows: &RecordBatch) -> AppResult<Vec<u8>> {
    let fail = |err| write_failure(OutputFormat::Csv, err);
    let mut writer = arrow_csv::WriterBuilder::new()
        .with_header(true)
        .build(Vec::new());
    writer.write(rows).map_err(fail)?;
    Ok(writer.into_inner())
}

/// Avro schema for an Arrow schema, one record named like Spark's default.
pub fn avro_schema_for(schema: &Schema) -> AppResult<apache_avro::Schema> {
    let fields = schema
        .fields()
        .iter()
        .map(|field| {
            if !is_avro_name(field.name()) {
                return Err(write_failure(
                    OutputFormat::Avro,
                    format!("column {} is not a valid avro field name", field.name()),
                ));
            }
            let base = match field.data_type() {
                DataType::Boolean => json!("boolean"),
                DataType::Int8 | DataType::Int16 | DataType::Int32 => json!("int"),
                DataType::Int64 => json!("long"),
                DataType::Float32 => json!("float"),
                DataType::Float64 => json!("double"),
                DataType::Utf8 => json!("string"),
                DataType::Binary => json!("bytes"),
                DataType::Date32 => json!({"type": "int", "logicalType": "date"}),
                DataType::Timestamp(TimeUnit::Microsecond, _) => {
                    json!({"type": "long", "logicalType": "timestamp-micros"})
                }
                other => {
                    return Err(write_failure(
                        OutputFormat::Avro,
                        format!("column {} has unsupported type {}", field.name(), other),
                    ))
                }
            };
            let field_type = if field.is_nullable() {
                json!(["null", base])
            } else {
                base
            };
            Ok(json!({"name": field.name(), "type": field_type}))
        })
        .collect::<AppResult<Vec<_>>>()?;

    let doc = json!({"type": "record", "name": "topLevelRecord", "fields": fields});
    apache_avro::Schema::parse(&doc).map_err(|err| write_failure(OutputFormat::Avro, err))
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_avro_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn encode_avro(rows: &RecordBatch) -> AppResult<Vec<u8>> {
    let schema = rows.schema();
    let avro_schema = avro_schema_for(&schema)?;
    let fail = |err| write_failure(OutputFormat::Avro, err);

    let mut writer = apache_avro::Writer::new(&avro_schema, Vec::new());
    for row in 0..rows.num_rows() {
        let mut fields = Vec::with_capacity(rows.num_columns());
        for (field, column) in schema.fields().iter().zip(rows.columns()) {
            let value = if column.is_null(row) {
                Value::Union(0, Box::new(Value::Null))
            } else {
                let value = avro_value(column.as_ref(), row)?;
                if field.is_nullable() {
                    Value::Union(1, Box::new(value))
                } else {
                    value
                }
            };
            fields.push((field.name().clone(), value));
        }
        writer.append(Value::Record(fields)).map_err(fail)?;
    }
    writer.into_inner().map_err(fail)
}

fn avro_value(column: &dyn Array, row: usize) -> AppResult<Value> {
    let value = match column.data_type() {
        DataType::Boolean => Value::Boolean(column.as_boolean().value(row)),
        DataType::Int8 => Value::Int(column.as_primitive::<Int8Type>().value(row) as i32),
        DataType::Int16 => Value::Int(column.as_primitive::<Int16Type>().value(row) as i32),
        DataType::Int32 => Value::Int(column.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => Value::Long(column.as_primitive::<Int64Type>().value(row)),
        DataType::Float32 => Value::Float(column.as_primitive::<Float32Type>().value(row)),
        DataType::Float64 => Value::Double(column.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::String(column.as_string::<i32>().value(row).to_string()),
        DataType::Binary => Value::Bytes(column.as_binary::<i32>().value(row).to_vec()),
        DataType::Date32 => Value::Date(column.as_primitive::<Date32Type>().value(row)),
        DataType::Timestamp(TimeUnit::Microsecond, _) => Value::TimestampMicros(
            column
                .as_primitive::<TimestampMicrosecondType>()
                .value(row),
        ),
        other => {
            return Err(write_failure(
                OutputFormat::Avro,
                format!("unsupported type {}", other),
            ))
        }
    };
    Ok(value)
}
