extern crate config as _;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::codec::MessageFormat;
use crate::sink::{OutputFormat, WriteMode};
use crate::source::StartingOffsets;

pub const ENV_PREFIX: &str = "STONESINK";
/// One day. Longer windows are rejected.
pub const MAX_BATCH_INTERVAL_MS: u64 = 86_400_000;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub project_id: String,
    pub log_level: String,
    /// When set, logs are also written to an hourly rolling file in this directory.
    pub log_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            project_id: String::new(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
    pub starting_offsets: String,
    pub batch_interval_ms: u64,
    /// Upper bound of records per batch; the window closes early once reached.
    pub max_poll_records: usize,
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub commit_channel_capacity: usize,
    /// Partition count used when the topic has to be created locally.
    pub partitions: i32,
    /// Committed offsets of the local log are checkpointed into this directory.
    pub checkpoint_dir: Option<String>,
    /// Extra librdkafka client properties, e.g. `"security.protocol" = "SSL"`.
    pub properties: BTreeMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            bootstrap_servers: String::new(),
            topic: String::new(),
            group_id: String::new(),
            starting_offsets: "latest".to_string(),
            batch_interval_ms: 0,
            max_poll_records: 10_000,
            fetch_retries: 3,
            retry_backoff_ms: 200,
            commit_channel_capacity: 64,
            partitions: 1,
            checkpoint_dir: None,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FormatConfig {
    pub message_format: String,
    pub schema_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub output_location: String,
    pub output_format: String,
    pub write_mode: String,
    pub write_empty_batches: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            output_location: String::new(),
            output_format: String::new(),
            write_mode: "append".to_string(),
            write_empty_batches: true,
        }
    }
}

/// Raw configuration as read from the config file and environment.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub general: GeneralConfig,
    pub source: SourceConfig,
    pub format: FormatConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
    pub starting_offsets: StartingOffsets,
    pub batch_interval: Duration,
    pub max_poll_records: usize,
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
    pub commit_channel_capacity: usize,
    pub partitions: i32,
    pub checkpoint_dir: Option<PathBuf>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkSettings {
    pub output_location: String,
    pub output_format: OutputFormat,
    pub write_mode: WriteMode,
    pub write_empty_batches: bool,
}

/// Validated, immutable settings handed to the pipeline once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub project_id: String,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub source: SourceSettings,
    pub message_format: MessageFormat,
    pub schema_url: Option<String>,
    pub sink: SinkSettings,
}

impl PipelineConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<PipelineConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let pipeline_config: PipelineConfig = config.try_deserialize()?;
        Ok(pipeline_config)
    }

    pub fn validate(&self) -> AppResult<PipelineSettings> {
        let required = [
            ("general.project_id", &self.general.project_id),
            ("sink.output_location", &self.sink.output_location),
            ("sink.output_format", &self.sink.output_format),
            ("sink.write_mode", &self.sink.write_mode),
            ("source.bootstrap_servers", &self.source.bootstrap_servers),
            ("source.topic", &self.source.topic),
            ("source.group_id", &self.source.group_id),
            ("format.message_format", &self.format.message_format),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::ConfigValidation(format!(
                "{} are required parameters",
                missing.join(",")
            )));
        }

        let message_format: MessageFormat = parse_setting(&self.format.message_format)?;
        let schema_url = self
            .format
            .schema_url
            .as_ref()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        if message_format.requires_schema() && schema_url.is_none() {
            return Err(AppError::ConfigValidation(format!(
                "format.schema_url is a required parameter for {} format messages",
                message_format
            )));
        }

        if self.source.batch_interval_ms == 0
            || self.source.batch_interval_ms > MAX_BATCH_INTERVAL_MS
        {
            return Err(AppError::ConfigValidation(format!(
                "source.batch_interval_ms must be in 1..={}, got {}",
                MAX_BATCH_INTERVAL_MS, self.source.batch_interval_ms
            )));
        }
        if self.source.partitions <= 0 {
            return Err(AppError::ConfigValidation(format!(
                "source.partitions must be positive, got {}",
                self.source.partitions
            )));
        }

        let source = SourceSettings {
            bootstrap_servers: self.source.bootstrap_servers.trim().to_string(),
            topic: self.source.topic.trim().to_string(),
            group_id: self.source.group_id.trim().to_string(),
            starting_offsets: parse_setting(&self.source.starting_offsets)?,
            batch_interval: Duration::from_millis(self.source.batch_interval_ms),
            max_poll_records: self.source.max_poll_records.max(1),
            fetch_retries: self.source.fetch_retries,
            retry_backoff: Duration::from_millis(self.source.retry_backoff_ms),
            commit_channel_capacity: self.source.commit_channel_capacity.max(1),
            partitions: self.source.partitions,
            checkpoint_dir: self.source.checkpoint_dir.as_ref().map(PathBuf::from),
            properties: self.source.properties.clone(),
        };
        let sink = SinkSettings {
            output_location: self.sink.output_location.trim().to_string(),
            output_format: parse_setting(&self.sink.output_format)?,
            write_mode: parse_setting(&self.sink.write_mode)?,
            write_empty_batches: self.sink.write_empty_batches,
        };

        Ok(PipelineSettings {
            project_id: self.general.project_id.trim().to_string(),
            log_level: self.general.log_level.clone(),
            log_dir: self.general.log_dir.as_ref().map(PathBuf::from),
            source,
            message_format,
            schema_url,
            sink,
        })
    }
}

fn parse_setting<T>(value: &str) -> AppResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.trim().parse().map_err(AppError::ConfigValidation)
}
