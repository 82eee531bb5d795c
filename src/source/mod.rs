use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

pub use checkpoint::CheckPointFile;
pub use committer::OffsetCommitter;
pub use kafka::KafkaConsumer;
pub use memory::{MemoryConsumer, MemoryLog};

use crate::message::{Batch, PartitionOffsetRange, TopicPartition};
use crate::AppResult;

mod checkpoint;
mod committer;
mod kafka;
mod memory;

/// `source.bootstrap_servers` value that selects the in-process [`MemoryLog`].
pub const MEMORY_BOOTSTRAP: &str = "memory";

/// Where a group without committed offsets starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingOffsets {
    Earliest,
    Latest,
}

impl FromStr for StartingOffsets {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "smallest" => Ok(StartingOffsets::Earliest),
            "latest" | "largest" => Ok(StartingOffsets::Latest),
            other => Err(format!("unknown starting offsets policy: {}", other)),
        }
    }
}

impl Display for StartingOffsets {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StartingOffsets::Earliest => write!(f, "earliest"),
            StartingOffsets::Latest => write!(f, "latest"),
        }
    }
}

/// The read side of the log as seen by the pipeline.
#[async_trait]
pub trait LogSource: Send {
    async fn subscribe(&mut self, topic: &str) -> AppResult<()>;

    /// Waits at most `timeout` and returns everything read in that window,
    /// possibly nothing. Advances the in-memory read position only.
    ///
    /// Must be cancel safe: dropping the future while it waits loses no records.
    async fn poll(&mut self, timeout: Duration) -> AppResult<Batch>;

    /// Queues a commit of the ranges and returns without waiting for it.
    fn commit_async(&self, offset_ranges: &[PartitionOffsetRange]);

    /// Flushes queued commits. Called once when the pipeline stops.
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Durable home of a consumer group's committed offsets.
#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: BTreeMap<TopicPartition, i64>,
    ) -> AppResult<()>;
}
