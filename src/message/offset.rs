use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use super::TopicPartition;
use crate::{AppError, AppResult};

/// Offsets `[from_offset, until_offset)` of one partition covered by a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffsetRange {
    topic_partition: TopicPartition,
    from_offset: i64,
    until_offset: i64,
}

impl PartitionOffsetRange {
    pub fn new(
        topic_partition: TopicPartition,
        from_offset: i64,
        until_offset: i64,
    ) -> AppResult<Self> {
        if until_offset < from_offset {
            return Err(AppError::InvalidValue(format!(
                "offset range of {}: until {} is before from {}",
                topic_partition, until_offset, from_offset
            )));
        }
        Ok(Self {
            topic_partition,
            from_offset,
            until_offset,
        })
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }
    pub fn partition(&self) -> i32 {
        self.topic_partition.partition
    }
    pub fn from_offset(&self) -> i64 {
        self.from_offset
    }
    pub fn until_offset(&self) -> i64 {
        self.until_offset
    }
    pub fn count(&self) -> i64 {
        self.until_offset - self.from_offset
    }
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
    pub fn contains(&self, offset: i64) -> bool {
        offset >= self.from_offset && offset < self.until_offset
    }
}

/// The next offset to read per partition once `ranges` are stored.
pub fn next_offsets(ranges: &[PartitionOffsetRange]) -> BTreeMap<TopicPartition, i64> {
    ranges
        .iter()
        .map(|range| (range.topic_partition.clone(), range.until_offset))
        .collect()
}

impl Display for PartitionOffsetRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: [{},{})",
            self.topic_partition, self.from_offset, self.until_offset
        )
    }
}
