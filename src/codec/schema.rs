//! Schema documents referenced by `format.schema_url`.
//!
//! JSON messages are described by a struct-type document:
//! `{"type":"struct","fields":[{"name":"id","type":"long","nullable":false}]}`.
//! Avro messages are described by a regular `.avsc` record schema. Both are
//! turned into the Arrow schema of the value columns.

use std::sync::Arc;

use apache_avro::schema::Schema as AvroSchema;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::Deserialize;
use tracing::debug;

use super::KEY_COLUMN;
use crate::sink::open_location;
use crate::{AppError, AppResult};

#[derive(Debug, Deserialize)]
struct StructTypeDoc {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    fields: Vec<StructFieldDoc>,
}

#[derive(Debug, Deserialize)]
struct StructFieldDoc {
    name: String,
    #[serde(rename = "type")]
    data_type: serde_json::Value,
    #[serde(default = "nullable_default")]
    nullable: bool,
}

fn nullable_default() -> bool {
    true
}

/// Reads the schema document behind `url` through the object store.
pub async fn fetch_schema_text(url: &str) -> AppResult<String> {
    let location = open_location(url)
        .map_err(|err| AppError::SchemaResolution(format!("{}: {}", url, err)))?;
    debug!("fetching schema from {}", location.uri);
    let bytes = location
        .store
        .get(&location.path)
        .await
        .map_err(|err| AppError::SchemaResolution(format!("{}: {}", url, err)))?
        .bytes()
        .await
        .map_err(|err| AppError::SchemaResolution(format!("{}: {}", url, err)))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| AppError::SchemaResolution(format!("{}: schema is not UTF-8", url)))
}

pub fn parse_struct_type(text: &str) -> AppResult<SchemaRef> {
    let doc: StructTypeDoc = serde_json::from_str(text)
        .map_err(|err| AppError::SchemaResolution(format!("invalid struct type: {}", err)))?;
    if let Some(kind) = &doc.kind {
        if kind != "struct" {
            return Err(AppError::SchemaResolution(format!(
                "top level type must be struct, got {}",
                kind
            )));
        }
    }

    let fields = doc
        .fields
        .iter()
        .map(|field| {
            let type_name = field.data_type.as_str().ok_or_else(|| {
                AppError::SchemaResolution(format!(
                    "field {}: nested types are not supported",
                    field.name
                ))
            })?;
            let data_type = struct_field_type(type_name).ok_or_else(|| {
                AppError::SchemaResolution(format!(
                    "field {}: unsupported type {}",
                    field.name, type_name
                ))
            })?;
            Ok(Field::new(&field.name, data_type, field.nullable))
        })
        .collect::<AppResult<Vec<_>>>()?;

    value_schema(fields)
}

fn struct_field_type(name: &str) -> Option<DataType> {
    let data_type = match name {
        "string" => DataType::Utf8,
        "binary" => DataType::Binary,
        "boolean" => DataType::Boolean,
        "byte" => DataType::Int8,
        "short" => DataType::Int16,
        "integer" => DataType::Int32,
        "long" => DataType::Int64,
        "float" => DataType::Float32,
        "double" => DataType::Float64,
        "date" => DataType::Date32,
        "timestamp" => DataType::Timestamp(TimeUnit::Microsecond, None),
        _ => return None,
    };
    Some(data_type)
}

pub fn parse_avro_schema(text: &str) -> AppResult<(AvroSchema, SchemaRef)> {
    let avro_schema = AvroSchema::parse_str(text)
        .map_err(|err| AppError::SchemaResolution(format!("invalid avro schema: {}", err)))?;
    let record = match &avro_schema {
        AvroSchema::Record(record) => record,
        _ => {
            return Err(AppError::SchemaResolution(
                "avro schema must be a record".to_string(),
            ))
        }
    };

    let fields = record
        .fields
        .iter()
        .map(|field| {
            let (data_type, nullable) = avro_field_type(&field.schema).ok_or_else(|| {
                AppError::SchemaResolution(format!(
                    "field {}: only primitive and nullable primitive types are supported",
                    field.name
                ))
            })?;
            Ok(Field::new(&field.name, data_type, nullable))
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok((avro_schema.clone(), value_schema(fields)?))
}

fn avro_primitive_type(schema: &AvroSchema) -> Option<DataType> {
    let data_type = match schema {
        AvroSchema::Boolean => DataType::Boolean,
        AvroSchema::Int => DataType::Int32,
        AvroSchema::Long => DataType::Int64,
        AvroSchema::Float => DataType::Float32,
        AvroSchema::Double => DataType::Float64,
        AvroSchema::Bytes => DataType::Binary,
        AvroSchema::String => DataType::Utf8,
        _ => return None,
    };
    Some(data_type)
}

fn avro_field_type(schema: &AvroSchema) -> Option<(DataType, bool)> {
    if let AvroSchema::Union(union) = schema {
        let variants = union.variants();
        if variants.len() != 2 {
            return None;
        }
        let non_null: Vec<&AvroSchema> = variants
            .iter()
            .filter(|variant| !matches!(variant, AvroSchema::Null))
            .collect();
        if non_null.len() != 1 {
            return None;
        }
        return avro_primitive_type(non_null[0]).map(|data_type| (data_type, true));
    }
    avro_primitive_type(schema).map(|data_type| (data_type, false))
}

fn value_schema(fields: Vec<Field>) -> AppResult<SchemaRef> {
    if fields.is_empty() {
        return Err(AppError::SchemaResolution(
            "schema declares no fields".to_string(),
        ));
    }
    if fields.iter().any(|field| field.name() == KEY_COLUMN) {
        return Err(AppError::SchemaResolution(format!(
            "field name {} collides with the record key column",
            KEY_COLUMN
        )));
    }
    let mut names: Vec<&str> = fields.iter().map(|field| field.name().as_str()).collect();
    names.sort_unstable();
    if let Some(dup) = names.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(AppError::SchemaResolution(format!(
            "duplicate field name {}",
            dup[0]
        )));
    }
    Ok(Arc::new(Schema::new(fields)))
}
