use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{LogSource, StartingOffsets};
use crate::message::{next_offsets, Batch, PartitionOffsetRange, RawRecord, TopicPartition};
use crate::service::SourceSettings;
use crate::{AppError, AppResult};

/// Reads a topic from a Kafka cluster as a member of `group_id`.
///
/// Offsets are never committed by the client on its own, only through
/// [`LogSource::commit_async`] once a batch has been written.
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    group_id: String,
    max_poll_records: usize,
    fetch_retries: u32,
    retry_backoff: Duration,
    topic: Option<String>,
    /// next offset to read per partition, as of the last returned batch
    positions: BTreeMap<i32, i64>,
    /// received but not yet handed out, survives a dropped poll
    pending: Vec<RawRecord>,
    /// latest queued commit per partition, committed again on close
    committed: Mutex<BTreeMap<TopicPartition, i64>>,
}

impl KafkaConsumer {
    pub fn new(settings: &SourceSettings) -> AppResult<Self> {
        let consumer: StreamConsumer = client_config(settings).create()?;
        info!(
            "kafka consumer for group {} created against {}",
            settings.group_id, settings.bootstrap_servers
        );
        Ok(KafkaConsumer {
            consumer: Arc::new(consumer),
            group_id: settings.group_id.clone(),
            max_poll_records: settings.max_poll_records,
            fetch_retries: settings.fetch_retries,
            retry_backoff: settings.retry_backoff,
            topic: None,
            positions: BTreeMap::new(),
            pending: Vec::new(),
            committed: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn positions(&self) -> &BTreeMap<i32, i64> {
        &self.positions
    }

    fn subscribed_topic(&self) -> AppResult<&str> {
        self.topic
            .as_deref()
            .ok_or_else(|| AppError::IllegalStateError("consumer is not subscribed".to_string()))
    }

    fn assigned_partitions(&self, topic: &str) -> AppResult<BTreeSet<i32>> {
        let assignment = self.consumer.assignment()?;
        Ok(assignment
            .elements_for_topic(topic)
            .iter()
            .map(|elem| elem.partition())
            .collect())
    }
}

fn client_config(settings: &SourceSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in &settings.properties {
        config.set(key, value);
    }
    let offset_reset = match settings.starting_offsets {
        StartingOffsets::Earliest => "earliest",
        StartingOffsets::Latest => "latest",
    };
    config
        .set("bootstrap.servers", &settings.bootstrap_servers)
        .set("group.id", &settings.group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", offset_reset);
    config
}

fn raw_record<M: Message>(message: &M) -> RawRecord {
    RawRecord::new(
        message.partition(),
        message.offset(),
        message.key().map(Bytes::copy_from_slice),
        message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
    )
}

/// Offset ranges of a batch plus the read positions that follow it.
///
/// A partition with records covers from its previous position (or its first
/// record) to one past its last record. An assigned partition without records
/// gets an empty range at its position when the position is known. Positions
/// of partitions that are neither assigned nor read are dropped.
fn batch_ranges(
    topic: &str,
    positions: &BTreeMap<i32, i64>,
    assigned: &BTreeSet<i32>,
    records: &[RawRecord],
) -> AppResult<(Vec<PartitionOffsetRange>, BTreeMap<i32, i64>)> {
    let mut read: BTreeMap<i32, (i64, i64)> = BTreeMap::new();
    for record in records {
        let bounds = read
            .entry(record.partition)
            .or_insert((record.offset, record.offset + 1));
        bounds.0 = bounds.0.min(record.offset);
        bounds.1 = bounds.1.max(record.offset + 1);
    }

    let partitions: BTreeSet<i32> = assigned.iter().chain(read.keys()).copied().collect();
    let mut ranges = Vec::with_capacity(partitions.len());
    let mut next_positions = BTreeMap::new();
    for partition in partitions {
        let position = positions.get(&partition).copied();
        let (from, until) = match (read.get(&partition), position) {
            (Some((first, until)), Some(position)) => (position.min(*first), *until),
            (Some((first, until)), None) => (*first, *until),
            (None, Some(position)) => (position, position),
            (None, None) => continue,
        };
        ranges.push(PartitionOffsetRange::new(
            TopicPartition::new(topic, partition),
            from,
            until,
        )?);
        next_positions.insert(partition, until);
    }
    Ok((ranges, next_positions))
}

fn commit_list(offsets: &BTreeMap<TopicPartition, i64>) -> AppResult<TopicPartitionList> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for (topic_partition, offset) in offsets {
        list.add_partition_offset(
            &topic_partition.topic,
            topic_partition.partition,
            Offset::Offset(*offset),
        )?;
    }
    Ok(list)
}

#[async_trait]
impl LogSource for KafkaConsumer {
    async fn subscribe(&mut self, topic: &str) -> AppResult<()> {
        self.consumer.subscribe(&[topic])?;
        info!("group {} subscribed to {}", self.group_id, topic);
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> AppResult<Batch> {
        let topic = self.subscribed_topic()?.to_string();
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            AppError::InvalidValue(format!("poll timeout {:?} is out of range", timeout))
        })?;

        let mut failures = 0;
        while self.pending.len() < self.max_poll_records {
            let received = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(received) => received.map(|message| raw_record(&message)),
            };
            match received {
                Ok(record) => {
                    failures = 0;
                    self.pending.push(record);
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.fetch_retries {
                        return Err(AppError::SourceUnavailable(format!(
                            "reading {} failed {} times: {}",
                            topic, failures, err
                        )));
                    }
                    warn!("reading {} failed (attempt {}): {}", topic, failures, err);
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }

        let assigned = self.assigned_partitions(&topic)?;
        let (ranges, next_positions) =
            batch_ranges(&topic, &self.positions, &assigned, &self.pending)?;
        let batch = Batch::new(std::mem::take(&mut self.pending), ranges)?;
        self.positions = next_positions;
        trace!("polled {} records from {}", batch.len(), topic);
        Ok(batch)
    }

    fn commit_async(&self, offset_ranges: &[PartitionOffsetRange]) {
        let offsets = next_offsets(offset_ranges);
        if offsets.is_empty() {
            return;
        }
        let committed = commit_list(&offsets).and_then(|list| {
            self.consumer
                .commit(&list, CommitMode::Async)
                .map_err(AppError::from)
        });
        match committed {
            Ok(()) => debug!("queued commit of {} partitions", offsets.len()),
            Err(err) => warn!("commit of {} partitions failed: {}", offsets.len(), err),
        }
        self.committed.lock().extend(offsets);
    }

    async fn close(&mut self) -> AppResult<()> {
        let offsets = std::mem::take(&mut *self.committed.lock());
        if offsets.is_empty() {
            return Ok(());
        }
        let list = commit_list(&offsets)?;
        let consumer = self.consumer.clone();
        let result = tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|err| AppError::CommitFailure(err.to_string()))?;
        match result {
            Ok(()) => {
                info!("committed final offsets of {} partitions", offsets.len());
                Ok(())
            }
            Err(err) => Err(AppError::CommitFailure(err.to_string())),
        }
    }
}
