use arrow::array::ArrayRef;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow_json::ReaderBuilder;
use serde_json::{Map, Value};

use super::decode_error;
use crate::message::RawRecord;
use crate::{AppError, AppResult};

type JsonObject = Map<String, Value>;

/// Projects JSON object values onto a fixed schema. Unknown fields are
/// dropped, missing nullable fields become null.
#[derive(Debug, Clone)]
pub struct JsonDecoder {
    value_schema: SchemaRef,
}

impl JsonDecoder {
    pub fn new(value_schema: SchemaRef) -> Self {
        JsonDecoder { value_schema }
    }

    pub fn value_schema(&self) -> &SchemaRef {
        &self.value_schema
    }

    pub fn decode(&self, records: &[RawRecord]) -> AppResult<Vec<ArrayRef>> {
        let objects = records
            .iter()
            .map(parse_object)
            .collect::<AppResult<Vec<_>>>()?;

        match self.decode_objects(&objects) {
            Ok(batch) => Ok(batch.columns().to_vec()),
            Err(batch_err) => {
                // the tape decoder reports type errors for the whole batch,
                // so find the record that caused it
                for (record, object) in records.iter().zip(&objects) {
                    if let Err(err) = self.decode_objects(std::slice::from_ref(object)) {
                        return Err(decode_error(record, err));
                    }
                }
                Err(AppError::IllegalStateError(format!(
                    "json batch failed without a failing record: {}",
                    batch_err
                )))
            }
        }
    }

    fn decode_objects(&self, objects: &[JsonObject]) -> Result<RecordBatch, ArrowError> {
        let mut decoder = ReaderBuilder::new(self.value_schema.clone())
            .with_batch_size(objects.len().max(1))
            .build_decoder()?;
        decoder.serialize(objects)?;
        Ok(decoder
            .flush()?
            .unwrap_or_else(|| RecordBatch::new_empty(self.value_schema.clone())))
    }
}

fn parse_object(record: &RawRecord) -> AppResult<JsonObject> {
    match serde_json::from_slice::<Value>(&record.value) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(decode_error(record, "value is not a JSON object")),
        Err(err) => Err(decode_error(record, err)),
    }
}
