pub use batch::Batch;
pub use offset::{next_offsets, PartitionOffsetRange};
pub use record::RawRecord;
pub use topic_partition::TopicPartition;

mod batch;
mod offset;
mod record;
mod topic_partition;
