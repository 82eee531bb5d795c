use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{CheckPointFile, LogSource, OffsetCommitter, OffsetStore, StartingOffsets};
use crate::message::{Batch, PartitionOffsetRange, RawRecord, TopicPartition};
use crate::service::SourceSettings;
use crate::{AppError, AppResult};

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<(Option<Bytes>, Bytes)>,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<RwLock<PartitionLog>>,
}

#[derive(Debug, Default)]
struct LogInner {
    topics: DashMap<String, Arc<TopicLog>>,
    /// group id -> committed next-offset per partition
    group_offsets: DashMap<String, BTreeMap<TopicPartition, i64>>,
    unavailable: AtomicBool,
    notify: Notify,
    checkpoint_dir: Option<PathBuf>,
    checkpoint_lock: Mutex<()>,
}

/// An in-process partitioned log with consumer group offsets.
///
/// It is the local stand-in for the external log system: producers append,
/// consumers fetch by offset, and groups commit the next offset to read.
/// With a checkpoint directory, committed offsets survive a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog::default()
    }

    /// Opens a log whose group offsets are checkpointed under `dir`, loading
    /// every group checkpoint already there.
    pub async fn with_checkpoint_dir(dir: impl AsRef<Path>) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let group_offsets = DashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CheckPointFile::FILE_SUFFIX) {
                continue;
            }
            let Some(group_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let points = CheckPointFile::new(&path).read_checkpoints().await?;
            info!(
                "loaded {} committed offsets of group {} from {}",
                points.len(),
                group_id,
                path.display()
            );
            group_offsets.insert(group_id.to_string(), points);
        }

        Ok(MemoryLog {
            inner: Arc::new(LogInner {
                group_offsets,
                checkpoint_dir: Some(dir),
                ..Default::default()
            }),
        })
    }

    /// Creating an existing topic is a no-op when the partition count matches.
    pub fn create_topic(&self, topic: &str, partitions: i32) -> AppResult<()> {
        if partitions <= 0 {
            return Err(AppError::InvalidValue(format!(
                "partition count {} for topic {}",
                partitions, topic
            )));
        }
        let existing = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(TopicLog {
                    partitions: (0..partitions)
                        .map(|_| RwLock::new(PartitionLog::default()))
                        .collect(),
                })
            })
            .clone();
        if existing.partitions.len() != partitions as usize {
            return Err(AppError::InvalidValue(format!(
                "topic {} already exists with {} partitions",
                topic,
                existing.partitions.len()
            )));
        }
        Ok(())
    }

    fn topic(&self, topic: &str) -> AppResult<Arc<TopicLog>> {
        self.inner
            .topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::SourceUnavailable(format!("unknown topic {}", topic)))
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.inner
            .topics
            .get(topic)
            .map(|entry| entry.partitions.len() as i32)
    }

    /// Appends a record and returns its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Bytes,
    ) -> AppResult<i64> {
        let topic_log = self.topic(topic)?;
        let partition_log = topic_log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| AppError::InvalidValue(format!("partition {}-{}", topic, partition)))?;
        let offset = {
            let mut log = partition_log.write();
            log.entries.push((key, value));
            log.entries.len() as i64 - 1
        };
        self.inner.notify.notify_waiters();
        Ok(offset)
    }

    pub fn log_end_offset(&self, topic: &str, partition: i32) -> AppResult<i64> {
        let topic_log = self.topic(topic)?;
        let partition_log = topic_log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| AppError::InvalidValue(format!("partition {}-{}", topic, partition)))?;
        let end = partition_log.read().entries.len() as i64;
        Ok(end)
    }

    /// Reads up to `max_records` starting at `from_offset`.
    pub fn fetch(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
        max_records: usize,
    ) -> AppResult<Vec<RawRecord>> {
        if !self.is_available() {
            return Err(AppError::SourceUnavailable(format!(
                "fetch {}-{} from offset {}",
                topic, partition, from_offset
            )));
        }
        let topic_log = self.topic(topic)?;
        let partition_log = topic_log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| AppError::InvalidValue(format!("partition {}-{}", topic, partition)))?;
        let log = partition_log.read();
        let start = from_offset.clamp(0, log.entries.len() as i64) as usize;
        let end = start.saturating_add(max_records).min(log.entries.len());
        Ok(log.entries[start..end]
            .iter()
            .enumerate()
            .map(|(i, (key, value))| {
                RawRecord::new(partition, (start + i) as i64, key.clone(), value.clone())
            })
            .collect())
    }

    pub fn committed_offset(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.inner
            .group_offsets
            .get(group_id)
            .and_then(|offsets| offsets.get(topic_partition).copied())
    }

    /// Simulates the log becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OffsetStore for MemoryLog {
    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: BTreeMap<TopicPartition, i64>,
    ) -> AppResult<()> {
        if !self.is_available() {
            return Err(AppError::CommitFailure(format!(
                "log unavailable, group {} offsets {:?} not committed",
                group_id, offsets
            )));
        }

        // checkpoint writes of concurrent commits must not interleave
        let _guard = self.inner.checkpoint_lock.lock().await;
        let snapshot = {
            let mut group = self
                .inner
                .group_offsets
                .entry(group_id.to_string())
                .or_default();
            group.extend(offsets);
            group.clone()
        };
        if let Some(dir) = &self.inner.checkpoint_dir {
            CheckPointFile::for_group(dir, group_id)
                .write_checkpoints(&snapshot)
                .await
                .map_err(|err| AppError::CommitFailure(format!("checkpoint: {}", err)))?;
        }
        trace!("group {} committed {:?}", group_id, snapshot);
        Ok(())
    }
}

/// A group member reading every partition of one topic from a [`MemoryLog`].
pub struct MemoryConsumer {
    log: MemoryLog,
    group_id: String,
    starting_offsets: StartingOffsets,
    max_poll_records: usize,
    fetch_retries: u32,
    retry_backoff: Duration,
    topic: Option<String>,
    /// next offset to read per partition
    positions: BTreeMap<i32, i64>,
    committer: OffsetCommitter,
}

impl MemoryConsumer {
    pub fn new(log: MemoryLog, settings: &SourceSettings) -> Self {
        let committer = OffsetCommitter::spawn(
            Arc::new(log.clone()),
            settings.group_id.clone(),
            settings.commit_channel_capacity,
        );
        MemoryConsumer {
            log,
            group_id: settings.group_id.clone(),
            starting_offsets: settings.starting_offsets,
            max_poll_records: settings.max_poll_records,
            fetch_retries: settings.fetch_retries,
            retry_backoff: settings.retry_backoff,
            topic: None,
            positions: BTreeMap::new(),
            committer,
        }
    }

    pub fn positions(&self) -> &BTreeMap<i32, i64> {
        &self.positions
    }

    fn subscribed_topic(&self) -> AppResult<&str> {
        self.topic
            .as_deref()
            .ok_or_else(|| AppError::IllegalStateError("consumer is not subscribed".to_string()))
    }

    fn lag(&self, topic: &str) -> AppResult<usize> {
        let mut lag = 0usize;
        for (partition, position) in &self.positions {
            let end = self.log.log_end_offset(topic, *partition)?;
            lag += (end - position).max(0) as usize;
        }
        Ok(lag)
    }

    async fn fetch_with_retry(
        &self,
        topic: &str,
        partition: i32,
        from_offset: i64,
        max_records: usize,
    ) -> AppResult<Vec<RawRecord>> {
        let mut attempt = 0;
        loop {
            match self.log.fetch(topic, partition, from_offset, max_records) {
                Err(AppError::SourceUnavailable(reason)) if attempt < self.fetch_retries => {
                    attempt += 1;
                    warn!(
                        "fetch attempt {}/{} failed: {}",
                        attempt, self.fetch_retries, reason
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl LogSource for MemoryConsumer {
    async fn subscribe(&mut self, topic: &str) -> AppResult<()> {
        let partitions = self
            .log
            .partition_count(topic)
            .ok_or_else(|| AppError::SourceUnavailable(format!("unknown topic {}", topic)))?;

        let mut positions = BTreeMap::new();
        for partition in 0..partitions {
            let topic_partition = TopicPartition::new(topic, partition);
            let position = match self.log.committed_offset(&self.group_id, &topic_partition) {
                Some(committed) => committed,
                None => match self.starting_offsets {
                    StartingOffsets::Earliest => 0,
                    StartingOffsets::Latest => self.log.log_end_offset(topic, partition)?,
                },
            };
            debug!("{} starts at offset {}", topic_partition, position);
            positions.insert(partition, position);
        }
        info!(
            "group {} subscribed to {} with {} partitions",
            self.group_id, topic, partitions
        );
        self.positions = positions;
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> AppResult<Batch> {
        let topic = self.subscribed_topic()?.to_string();
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            AppError::InvalidValue(format!("poll timeout {:?} is out of range", timeout))
        })?;
        loop {
            // register before checking so a produce in between is not missed
            let notified = self.log.inner.notify.notified();
            if self.lag(&topic)? >= self.max_poll_records {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let mut budget = self.max_poll_records;
        let mut records = Vec::new();
        let mut ranges = Vec::with_capacity(self.positions.len());
        let mut next_positions = self.positions.clone();
        for (partition, position) in &self.positions {
            let fetched = if budget > 0 {
                self.fetch_with_retry(&topic, *partition, *position, budget)
                    .await?
            } else {
                Vec::new()
            };
            budget -= fetched.len();
            let until = position + fetched.len() as i64;
            ranges.push(PartitionOffsetRange::new(
                TopicPartition::new(topic.as_str(), *partition),
                *position,
                until,
            )?);
            next_positions.insert(*partition, until);
            records.extend(fetched);
        }

        let batch = Batch::new(records, ranges)?;
        // positions move only once the whole batch is assembled
        self.positions = next_positions;
        trace!("polled {} records from {}", batch.len(), topic);
        Ok(batch)
    }

    fn commit_async(&self, offset_ranges: &[PartitionOffsetRange]) {
        self.committer.commit_async(offset_ranges);
    }

    async fn close(&mut self) -> AppResult<()> {
        self.committer.shutdown().await;
        Ok(())
    }
}
