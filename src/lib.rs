pub mod codec;
pub mod message;
pub mod pipeline;
pub mod service;
pub mod sink;
pub mod source;

pub use codec::{MessageFormat, RecordDecoder};
pub use message::{Batch, PartitionOffsetRange, RawRecord, TopicPartition};
pub use pipeline::{Pipeline, PipelineState, PipelineSummary};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, LogGuard, PipelineConfig,
    PipelineSettings, Shutdown,
};
pub use sink::{BatchSink, ObjectStoreSink, OutputFormat, WriteMode, WriteOutcome, WriteResult};
pub use source::{
    KafkaConsumer, LogSource, MemoryConsumer, MemoryLog, OffsetStore, StartingOffsets,
    MEMORY_BOOTSTRAP,
};
