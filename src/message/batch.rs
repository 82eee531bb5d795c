use std::collections::HashMap;

use super::{PartitionOffsetRange, RawRecord};
use crate::{AppError, AppResult};

/// Records read in one batch window together with the offset range they cover
/// on every assigned partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<RawRecord>,
    offset_ranges: Vec<PartitionOffsetRange>,
}

impl Batch {
    /// Checks that ranges are unique per partition and that every record falls
    /// inside the range of its partition.
    pub fn new(records: Vec<RawRecord>, offset_ranges: Vec<PartitionOffsetRange>) -> AppResult<Self> {
        let mut by_partition = HashMap::with_capacity(offset_ranges.len());
        for range in &offset_ranges {
            if by_partition.insert(range.partition(), range).is_some() {
                return Err(AppError::IllegalStateError(format!(
                    "duplicate offset range for partition {}",
                    range.partition()
                )));
            }
        }
        for record in &records {
            let covered = by_partition
                .get(&record.partition)
                .map(|range| range.contains(record.offset))
                .unwrap_or(false);
            if !covered {
                return Err(AppError::IllegalStateError(format!(
                    "record at partition {} offset {} is outside the batch offset ranges",
                    record.partition, record.offset
                )));
            }
        }
        Ok(Batch {
            records,
            offset_ranges,
        })
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn offset_ranges(&self) -> &[PartitionOffsetRange] {
        &self.offset_ranges
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
