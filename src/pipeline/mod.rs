//! The driver loop: read a batch, decode it, write it, then commit its offsets.
//!
//! Offsets of a batch are handed to the source only after the sink reported
//! the batch as stored, so a crash anywhere in between leads to the batch being
//! read again on restart rather than lost.

use std::fmt::{Display, Formatter};

use tracing::{debug, error, info, warn};

use crate::codec::{self, RecordDecoder};
use crate::message::Batch;
use crate::service::{PipelineSettings, Shutdown};
use crate::sink::{avro_schema_for, BatchSink, OutputFormat};
use crate::source::LogSource;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
            PipelineState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Totals of a run that stopped on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub batches: u64,
    pub records: u64,
    pub rows_written: u64,
    pub state: PipelineState,
}

pub struct Pipeline<S, W> {
    settings: PipelineSettings,
    source: S,
    sink: W,
    decoder: Option<RecordDecoder>,
    state: PipelineState,
    batches: u64,
    records: u64,
    rows_written: u64,
}

impl<S: LogSource, W: BatchSink> Pipeline<S, W> {
    pub fn new(settings: PipelineSettings, source: S, sink: W) -> Self {
        Pipeline {
            settings,
            source,
            sink,
            decoder: None,
            state: PipelineState::Starting,
            batches: 0,
            records: 0,
            rows_written: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Resolves the decoder and subscribes the source. Nothing is read here.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.state != PipelineState::Starting {
            return Err(AppError::IllegalStateError(format!(
                "cannot start a {} pipeline",
                self.state
            )));
        }
        match self.open().await {
            Ok(()) => {
                self.transition(PipelineState::Running);
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn open(&mut self) -> AppResult<()> {
        let format = self.settings.message_format;
        if format.requires_schema() && self.settings.schema_url.is_none() {
            return Err(AppError::ConfigValidation(format!(
                "format.schema_url is a required parameter for {} format messages",
                format
            )));
        }
        let decoder = RecordDecoder::resolve(format, self.settings.schema_url.as_deref()).await?;
        if self.settings.sink.output_format == OutputFormat::Avro {
            avro_schema_for(&decoder.output_schema()).map_err(|err| {
                AppError::ConfigValidation(format!("rows cannot be written as avro: {}", err))
            })?;
        }
        self.decoder = Some(decoder);

        let topic = self.settings.source.topic.clone();
        self.source.subscribe(&topic).await?;
        info!(
            "project {}: {} messages from {} ({}) to {} as {} in {} mode",
            self.settings.project_id,
            format,
            topic,
            self.settings.source.bootstrap_servers,
            self.settings.sink.output_location,
            self.settings.sink.output_format,
            self.settings.sink.write_mode
        );
        Ok(())
    }

    /// Runs batches until `shutdown` fires or a batch fails.
    ///
    /// The signal is checked before every read and while the read waits for
    /// records. A batch that has been read is always finished first.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> AppResult<PipelineSummary> {
        if self.state == PipelineState::Starting {
            self.start().await?;
        }
        if self.state != PipelineState::Running {
            return Err(AppError::IllegalStateError(format!(
                "cannot run a {} pipeline",
                self.state
            )));
        }

        let batch_interval = self.settings.source.batch_interval;
        loop {
            if shutdown.poll_shutdown() {
                break;
            }
            let polled = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("shutdown signal received while waiting for records");
                    break;
                }
                polled = self.source.poll(batch_interval) => polled,
            };
            let result = match polled {
                Ok(batch) => self.process_batch(batch).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                return Err(self.fail(err).await);
            }
        }

        self.transition(PipelineState::Stopping);
        self.source.close().await?;
        self.transition(PipelineState::Stopped);
        let summary = self.summary();
        info!(
            "pipeline stopped after {} batches, {} records, {} rows written",
            summary.batches, summary.records, summary.rows_written
        );
        Ok(summary)
    }

    async fn process_batch(&mut self, batch: Batch) -> AppResult<()> {
        let decoder = self.decoder.as_ref().ok_or_else(|| {
            AppError::IllegalStateError("pipeline running without a decoder".to_string())
        })?;

        if batch.is_empty() && !self.settings.sink.write_empty_batches {
            debug!("empty batch, skipping write and commit");
            self.batches += 1;
            return Ok(());
        }

        let rows = codec::decode(&batch, decoder)?;
        let result = self
            .sink
            .write(
                &rows,
                self.settings.sink.output_format,
                self.settings.sink.write_mode,
            )
            .await?;
        self.source.commit_async(batch.offset_ranges());

        self.batches += 1;
        self.records += batch.len() as u64;
        self.rows_written += result.rows_written as u64;
        if batch.is_empty() {
            debug!("empty batch written to {}", result.location);
        } else {
            info!(
                "batch of {} records stored as {:?} ({:?}), ranges {}",
                batch.len(),
                result.files,
                result.outcome,
                batch
                    .offset_ranges()
                    .iter()
                    .map(|range| range.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(())
    }

    fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            batches: self.batches,
            records: self.records,
            rows_written: self.rows_written,
            state: self.state,
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("pipeline {} -> {}", self.state, next);
        self.state = next;
    }

    /// Moves to `Failed`, flushing commits of earlier batches, and hands back the error.
    async fn fail(&mut self, err: AppError) -> AppError {
        error!("pipeline failed: {}", err);
        self.transition(PipelineState::Failed);
        if let Err(close_err) = self.source.close().await {
            warn!("closing source after failure: {}", close_err);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use arrow::array::{Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use async_trait::async_trait;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::ObjectStore;
    use parking_lot::Mutex;
    use rstest::{fixture, rstest};
    use tokio::sync::broadcast;

    use super::*;
    use crate::codec::MessageFormat;
    use crate::message::{PartitionOffsetRange, RawRecord, TopicPartition};
    use crate::service::{SinkSettings, SourceSettings};
    use crate::sink::{ObjectStoreSink, StoreLocation, WriteMode, WriteOutcome, WriteResult};
    use crate::source::StartingOffsets;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Subscribe(String),
        Poll,
        Write(RecordBatch),
        Commit(Vec<(i32, i64, i64)>),
        Close,
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    /// Replays scripted poll results, then raises shutdown and waits forever.
    struct ScriptedSource {
        script: VecDeque<AppResult<Batch>>,
        events: Events,
        notify_shutdown: broadcast::Sender<()>,
        signal_during_first_poll: bool,
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        async fn subscribe(&mut self, topic: &str) -> AppResult<()> {
            self.events.lock().push(Event::Subscribe(topic.to_string()));
            Ok(())
        }

        async fn poll(&mut self, _timeout: Duration) -> AppResult<Batch> {
            self.events.lock().push(Event::Poll);
            if self.signal_during_first_poll {
                self.signal_during_first_poll = false;
                let _ = self.notify_shutdown.send(());
            }
            match self.script.pop_front() {
                Some(result) => result,
                None => {
                    let _ = self.notify_shutdown.send(());
                    std::future::pending::<AppResult<Batch>>().await
                }
            }
        }

        fn commit_async(&self, offset_ranges: &[PartitionOffsetRange]) {
            self.events.lock().push(Event::Commit(
                offset_ranges
                    .iter()
                    .map(|range| (range.partition(), range.from_offset(), range.until_offset()))
                    .collect(),
            ));
        }

        async fn close(&mut self) -> AppResult<()> {
            self.events.lock().push(Event::Close);
            Ok(())
        }
    }

    struct RecordingSink {
        events: Events,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn write(
            &self,
            rows: &RecordBatch,
            format: OutputFormat,
            mode: WriteMode,
        ) -> AppResult<WriteResult> {
            self.events.lock().push(Event::Write(rows.clone()));
            Ok(WriteResult {
                location: "memory://test".to_string(),
                format,
                mode,
                rows_written: rows.num_rows(),
                files: vec![],
                outcome: WriteOutcome::Written,
            })
        }
    }

    struct FailingSink;

    #[async_trait]
    impl BatchSink for FailingSink {
        async fn write(&self, _: &RecordBatch, _: OutputFormat, _: WriteMode) -> AppResult<WriteResult> {
            Err(AppError::WriteFailure("bucket is read only".into()))
        }
    }

    #[fixture]
    fn settings() -> PipelineSettings {
        PipelineSettings {
            project_id: "demo".into(),
            log_level: "debug".into(),
            log_dir: None,
            source: SourceSettings {
                bootstrap_servers: "memory".into(),
                topic: "orders".into(),
                group_id: "g1".into(),
                starting_offsets: StartingOffsets::Earliest,
                batch_interval: Duration::from_millis(50),
                max_poll_records: 100,
                fetch_retries: 0,
                retry_backoff: Duration::from_millis(1),
                commit_channel_capacity: 8,
                partitions: 1,
                checkpoint_dir: None,
                properties: Default::default(),
            },
            message_format: MessageFormat::Raw,
            schema_url: None,
            sink: SinkSettings {
                output_location: "memory://test".into(),
                output_format: OutputFormat::Parquet,
                write_mode: WriteMode::Append,
                write_empty_batches: true,
            },
        }
    }

    fn range(partition: i32, from: i64, until: i64) -> PartitionOffsetRange {
        PartitionOffsetRange::new(TopicPartition::new("orders", partition), from, until).unwrap()
    }

    fn record(partition: i32, offset: i64, key: &'static str, value: &'static str) -> RawRecord {
        RawRecord::new(
            partition,
            offset,
            Some(Bytes::from_static(key.as_bytes())),
            Bytes::from_static(value.as_bytes()),
        )
    }

    fn scripted(script: Vec<AppResult<Batch>>) -> (ScriptedSource, Events, Shutdown) {
        let events = Events::default();
        let (notify_shutdown, _) = broadcast::channel(1);
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let source = ScriptedSource {
            script: script.into(),
            events: events.clone(),
            notify_shutdown,
            signal_during_first_poll: false,
        };
        (source, events, shutdown)
    }

    fn commits(events: &Events) -> Vec<Vec<(i32, i64, i64)>> {
        events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Commit(ranges) => Some(ranges.clone()),
                _ => None,
            })
            .collect()
    }

    fn writes(events: &Events) -> Vec<RecordBatch> {
        events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Write(rows) => Some(rows.clone()),
                _ => None,
            })
            .collect()
    }

    fn strings(rows: &RecordBatch, column: usize) -> Vec<Option<String>> {
        let array = rows
            .column(column)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        (0..array.len())
            .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
            .collect()
    }

    #[rstest]
    #[tokio::test]
    async fn raw_batch_is_written_before_commit(settings: PipelineSettings) {
        let batch = Batch::new(
            vec![record(0, 10, "a", "v1"), record(0, 11, "b", "v2")],
            vec![range(0, 10, 12)],
        )
        .unwrap();
        let (source, events, shutdown) = scripted(vec![Ok(batch)]);
        let sink = RecordingSink {
            events: events.clone(),
        };

        let mut pipeline = Pipeline::new(settings, source, sink);
        let summary = pipeline.run(shutdown).await.unwrap();
        assert_eq!(summary.state, PipelineState::Stopped);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.rows_written, 2);

        let recorded = events.lock().clone();
        let write_at = recorded
            .iter()
            .position(|e| matches!(e, Event::Write(_)))
            .unwrap();
        let commit_at = recorded
            .iter()
            .position(|e| matches!(e, Event::Commit(_)))
            .unwrap();
        assert!(write_at < commit_at);
        assert_eq!(recorded[0], Event::Subscribe("orders".into()));
        assert_eq!(recorded.last(), Some(&Event::Close));

        let rows = &writes(&events)[0];
        assert_eq!(rows.num_rows(), 2);
        assert_eq!(strings(rows, 0), vec![Some("a".into()), Some("b".into())]);
        assert_eq!(strings(rows, 1), vec![Some("v1".into()), Some("v2".into())]);
        assert_eq!(commits(&events), vec![vec![(0, 10, 12)]]);
    }

    #[rstest]
    #[tokio::test]
    async fn commits_are_contiguous_per_partition(settings: PipelineSettings) {
        let script = vec![
            Ok(Batch::new(
                vec![record(0, 0, "a", "1"), record(0, 1, "a", "2")],
                vec![range(0, 0, 2), range(1, 0, 0)],
            )
            .unwrap()),
            Ok(Batch::new(vec![record(1, 0, "b", "3")], vec![range(0, 2, 2), range(1, 0, 1)]).unwrap()),
            Ok(Batch::new(
                vec![record(0, 2, "c", "4"), record(1, 1, "c", "5")],
                vec![range(0, 2, 3), range(1, 1, 2)],
            )
            .unwrap()),
        ];
        let (source, events, shutdown) = scripted(script);
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);
        let summary = pipeline.run(shutdown).await.unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.records, 5);

        let commits = commits(&events);
        assert_eq!(commits.len(), 3);
        for partition in 0..2 {
            let ranges: Vec<(i64, i64)> = commits
                .iter()
                .flatten()
                .filter(|(p, _, _)| *p == partition)
                .map(|(_, from, until)| (*from, *until))
                .collect();
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].1, pair[1].0);
            }
        }
    }

    #[rstest]
    #[tokio::test]
    async fn json_without_schema_fails_before_any_read(mut settings: PipelineSettings) {
        settings.message_format = MessageFormat::Json;
        settings.schema_url = None;
        let (source, events, shutdown) = scripted(vec![]);
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);

        let err = pipeline.run(shutdown).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigValidation(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(!events.lock().iter().any(|e| *e == Event::Poll));
    }

    #[rstest]
    #[tokio::test]
    async fn avro_output_with_invalid_column_name_fails_before_any_read(
        mut settings: PipelineSettings,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("users.json");
        std::fs::write(
            &schema_path,
            r#"{"type":"struct","fields":[{"name":"user-id","type":"long","nullable":false}]}"#,
        )
        .unwrap();
        settings.message_format = MessageFormat::Json;
        settings.schema_url = Some(schema_path.to_string_lossy().into_owned());
        settings.sink.output_format = OutputFormat::Avro;
        let (source, events, shutdown) = scripted(vec![]);
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);

        let err = pipeline.run(shutdown).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigValidation(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(!events
            .lock()
            .iter()
            .any(|e| matches!(e, Event::Subscribe(_) | Event::Poll)));
    }

    #[rstest]
    #[tokio::test]
    async fn unreachable_schema_fails_start(mut settings: PipelineSettings) {
        settings.message_format = MessageFormat::Avro;
        settings.schema_url = Some("/definitely/not/here/schema.avsc".into());
        let (source, events, _shutdown) = scripted(vec![]);
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);
        assert!(matches!(
            pipeline.start().await,
            Err(AppError::SchemaResolution(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(pipeline.start().await.is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn conflicting_destination_is_not_committed(mut settings: PipelineSettings) {
        settings.sink.write_mode = WriteMode::ErrorIfExists;
        let store = Arc::new(InMemory::new());
        store
            .put(&Path::from("lake/orders/existing.parquet"), Bytes::from_static(b"old").into())
            .await
            .unwrap();
        let sink = ObjectStoreSink::new(StoreLocation::in_memory(store, "lake/orders"));

        let batch = Batch::new(vec![record(0, 0, "a", "v")], vec![range(0, 0, 1)]).unwrap();
        let (source, events, shutdown) = scripted(vec![Ok(batch)]);
        let mut pipeline = Pipeline::new(settings, source, sink);

        let err = pipeline.run(shutdown).await.unwrap_err();
        assert!(matches!(err, AppError::DestinationConflict(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(commits(&events).is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn failed_write_is_not_committed(settings: PipelineSettings) {
        let first = Batch::new(vec![record(0, 0, "a", "v")], vec![range(0, 0, 1)]).unwrap();
        let (source, events, shutdown) = scripted(vec![Ok(first)]);
        let mut pipeline = Pipeline::new(settings, source, FailingSink);

        let err = pipeline.run(shutdown).await.unwrap_err();
        assert!(matches!(err, AppError::WriteFailure(_)));
        assert!(commits(&events).is_empty());
        assert_eq!(events.lock().last(), Some(&Event::Close));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    #[tokio::test]
    async fn empty_batch_policy(mut settings: PipelineSettings, #[case] write_empty: bool) {
        settings.sink.write_empty_batches = write_empty;
        let empty = Batch::new(vec![], vec![range(0, 7, 7)]).unwrap();
        let (source, events, shutdown) = scripted(vec![Ok(empty)]);
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);
        let summary = pipeline.run(shutdown).await.unwrap();
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.rows_written, 0);

        let writes = writes(&events);
        let commits = commits(&events);
        if write_empty {
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].num_rows(), 0);
            assert_eq!(commits, vec![vec![(0, 7, 7)]]);
        } else {
            assert!(writes.is_empty());
            assert!(commits.is_empty());
        }
    }

    #[rstest]
    #[tokio::test]
    async fn decode_error_stops_before_write(settings: PipelineSettings) {
        let bad = RawRecord::new(0, 4, None, Bytes::from_static(&[0xff, 0xfe]));
        let batch = Batch::new(vec![bad], vec![range(0, 4, 5)]).unwrap();
        let (source, events, shutdown) = scripted(vec![Ok(batch)]);
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);

        match pipeline.run(shutdown).await {
            Err(AppError::Decode {
                partition, offset, ..
            }) => assert_eq!((partition, offset), (0, 4)),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(writes(&events).is_empty());
        assert!(commits(&events).is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn unavailable_source_fails_after_earlier_commits(settings: PipelineSettings) {
        let first = Batch::new(vec![record(0, 0, "a", "v")], vec![range(0, 0, 1)]).unwrap();
        let (source, events, shutdown) = scripted(vec![
            Ok(first),
            Err(AppError::SourceUnavailable("broker down".into())),
        ]);
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);

        assert!(matches!(
            pipeline.run(shutdown).await,
            Err(AppError::SourceUnavailable(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(commits(&events), vec![vec![(0, 0, 1)]]);
    }

    #[rstest]
    #[tokio::test]
    async fn batch_in_flight_finishes_on_shutdown(settings: PipelineSettings) {
        let batch = Batch::new(vec![record(0, 3, "k", "v")], vec![range(0, 3, 4)]).unwrap();
        let (mut source, events, shutdown) = scripted(vec![Ok(batch)]);
        source.signal_during_first_poll = true;
        let sink = RecordingSink {
            events: events.clone(),
        };
        let mut pipeline = Pipeline::new(settings, source, sink);

        let summary = pipeline.run(shutdown).await.unwrap();
        assert_eq!(summary.state, PipelineState::Stopped);
        assert_eq!(summary.batches, 1);
        assert_eq!(commits(&events), vec![vec![(0, 3, 4)]]);
        // no second read after the signal
        let polls = events.lock().iter().filter(|e| **e == Event::Poll).count();
        assert_eq!(polls, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn shutdown_before_start_reads_nothing(settings: PipelineSettings) {
        let (source, events, shutdown) = scripted(vec![]);
        let sink = RecordingSink {
            events: events.clone(),
        };
        source.notify_shutdown.send(()).unwrap();
        let mut pipeline = Pipeline::new(settings, source, sink);
        let summary = pipeline.run(shutdown).await.unwrap();
        assert_eq!(summary.batches, 0);
        assert!(!events.lock().iter().any(|e| *e == Event::Poll));
    }
}
