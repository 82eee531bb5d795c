// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// pipeline errors
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("schema resolution failed: {0}")]
    SchemaResolution(String),

    #[error("decode failed at partition {partition} offset {offset}: {reason}")]
    Decode {
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("destination already contains data: {0}")]
    DestinationConflict(String),

    #[error("write failed: {0}")]
    WriteFailure(String),

    #[error("offset commit failed: {0}")]
    CommitFailure(String),
}

impl AppError {
    /// Only a failed commit leaves the pipeline running; the affected range is
    /// re-delivered after a restart.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AppError::CommitFailure(_))
    }
}

impl From<object_store::Error> for AppError {
    fn from(value: object_store::Error) -> Self {
        match value {
            object_store::Error::AlreadyExists { path, .. } => AppError::DestinationConflict(path),
            other => AppError::WriteFailure(other.to_string()),
        }
    }
}

impl From<rdkafka::error::KafkaError> for AppError {
    fn from(value: rdkafka::error::KafkaError) -> Self {
        AppError::SourceUnavailable(value.to_string())
    }
}

impl From<std::num::ParseIntError> for AppError {
    fn from(value: std::num::ParseIntError) -> Self {
        AppError::InvalidValue(value.to_string())
    }
}
