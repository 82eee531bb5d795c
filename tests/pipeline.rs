use std::fs::File;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use stonesink::service::{SinkSettings, SourceSettings};
use stonesink::{
    setup_local_tracing, MemoryConsumer, MemoryLog, MessageFormat, ObjectStoreSink, OutputFormat,
    Pipeline, PipelineSettings, PipelineState, Shutdown, StartingOffsets, TopicPartition,
    WriteMode,
};
use tokio::sync::broadcast;

const TOPIC: &str = "clicks";
const GROUP: &str = "clicks-to-lake";

fn settings(destination: &Path, checkpoint_dir: Option<&Path>) -> PipelineSettings {
    PipelineSettings {
        project_id: "it".into(),
        log_level: "debug".into(),
        log_dir: None,
        source: SourceSettings {
            bootstrap_servers: "memory".into(),
            topic: TOPIC.into(),
            group_id: GROUP.into(),
            starting_offsets: StartingOffsets::Earliest,
            batch_interval: Duration::from_millis(20),
            max_poll_records: 1_000,
            fetch_retries: 1,
            retry_backoff: Duration::from_millis(5),
            commit_channel_capacity: 16,
            partitions: 2,
            checkpoint_dir: checkpoint_dir.map(Path::to_path_buf),
            properties: Default::default(),
        },
        message_format: MessageFormat::Raw,
        schema_url: None,
        sink: SinkSettings {
            output_location: destination.to_string_lossy().into_owned(),
            output_format: OutputFormat::Parquet,
            write_mode: WriteMode::Append,
            write_empty_batches: true,
        },
    }
}

/// Raises shutdown once the group committed `expected` on every partition.
fn stop_when_committed(
    log: MemoryLog,
    expected: Vec<(i32, i64)>,
) -> (Shutdown, tokio::task::JoinHandle<()>) {
    let (notify_shutdown, _) = broadcast::channel(1);
    let shutdown = Shutdown::new(notify_shutdown.subscribe());
    let watcher = tokio::spawn(async move {
        loop {
            let done = expected.iter().all(|(partition, offset)| {
                log.committed_offset(GROUP, &TopicPartition::new(TOPIC, *partition))
                    == Some(*offset)
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = notify_shutdown.send(());
    });
    (shutdown, watcher)
}

fn parquet_values(dir: &Path) -> Vec<String> {
    let mut values = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        assert!(path.to_string_lossy().ends_with(".snappy.parquet"));
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        for batch in reader {
            let batch = batch.unwrap();
            let column = batch
                .column_by_name("value")
                .unwrap()
                .as_any()
                .downcast_ref::<arrow::array::StringArray>()
                .unwrap()
                .clone();
            values.extend(column.iter().map(|value| value.unwrap().to_string()));
        }
    }
    values.sort();
    values
}

#[tokio::test]
async fn records_land_in_parquet_and_offsets_are_committed() {
    setup_local_tracing().unwrap();
    let lake = tempfile::tempdir().unwrap();
    let settings = settings(lake.path(), None);

    let log = MemoryLog::new();
    log.create_topic(TOPIC, 2).unwrap();
    for (partition, value) in [(0, "v1"), (1, "v2"), (0, "v3")] {
        log.produce(TOPIC, partition, Some(Bytes::from("k")), Bytes::from(value))
            .unwrap();
    }

    let consumer = MemoryConsumer::new(log.clone(), &settings.source);
    let sink = ObjectStoreSink::open(&settings.sink.output_location).unwrap();
    let (shutdown, watcher) = stop_when_committed(log.clone(), vec![(0, 2), (1, 1)]);

    let mut pipeline = Pipeline::new(settings, consumer, sink);
    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run(shutdown))
        .await
        .unwrap()
        .unwrap();
    watcher.await.unwrap();

    assert_eq!(summary.state, PipelineState::Stopped);
    assert_eq!(summary.records, 3);
    assert_eq!(summary.rows_written, 3);
    assert_eq!(parquet_values(lake.path()), vec!["v1", "v2", "v3"]);
}

#[tokio::test]
async fn restart_resumes_after_last_commit() {
    let lake = tempfile::tempdir().unwrap();
    let checkpoints = tempfile::tempdir().unwrap();
    let settings = settings(lake.path(), Some(checkpoints.path()));

    {
        let log = MemoryLog::with_checkpoint_dir(checkpoints.path()).await.unwrap();
        log.create_topic(TOPIC, 2).unwrap();
        log.produce(TOPIC, 0, None, Bytes::from("first")).unwrap();
        log.produce(TOPIC, 1, None, Bytes::from("second")).unwrap();

        let consumer = MemoryConsumer::new(log.clone(), &settings.source);
        let sink = ObjectStoreSink::open(&settings.sink.output_location).unwrap();
        let (shutdown, watcher) = stop_when_committed(log.clone(), vec![(0, 1), (1, 1)]);
        let mut pipeline = Pipeline::new(settings.clone(), consumer, sink);
        tokio::time::timeout(Duration::from_secs(10), pipeline.run(shutdown))
            .await
            .unwrap()
            .unwrap();
        watcher.await.unwrap();
    }

    // the log keeps its records across the restart, plus one new record
    let log = MemoryLog::with_checkpoint_dir(checkpoints.path()).await.unwrap();
    log.create_topic(TOPIC, 2).unwrap();
    log.produce(TOPIC, 0, None, Bytes::from("first")).unwrap();
    log.produce(TOPIC, 1, None, Bytes::from("second")).unwrap();
    log.produce(TOPIC, 0, None, Bytes::from("third")).unwrap();

    let consumer = MemoryConsumer::new(log.clone(), &settings.source);
    let sink = ObjectStoreSink::open(&settings.sink.output_location).unwrap();
    let (shutdown, watcher) = stop_when_committed(log.clone(), vec![(0, 2), (1, 1)]);
    let mut pipeline = Pipeline::new(settings, consumer, sink);
    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run(shutdown))
        .await
        .unwrap()
        .unwrap();
    watcher.await.unwrap();

    assert_eq!(summary.records, 1);
    assert_eq!(parquet_values(lake.path()), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn json_messages_are_projected_onto_schema() {
    let lake = tempfile::tempdir().unwrap();
    let schema_dir = tempfile::tempdir().unwrap();
    let schema_path = schema_dir.path().join("clicks.json");
    std::fs::write(
        &schema_path,
        r#"{"type":"struct","fields":[
            {"name":"user","type":"string","nullable":false},
            {"name":"count","type":"long","nullable":true}
        ]}"#,
    )
    .unwrap();

    let mut settings = settings(lake.path(), None);
    settings.message_format = MessageFormat::Json;
    settings.schema_url = Some(schema_path.to_string_lossy().into_owned());
    settings.sink.output_format = OutputFormat::Json;
    settings.source.partitions = 1;

    let log = MemoryLog::new();
    log.create_topic(TOPIC, 1).unwrap();
    log.produce(
        TOPIC,
        0,
        Some(Bytes::from("u1")),
        Bytes::from(r#"{"user":"ann","count":3,"ignored":true}"#),
    )
    .unwrap();
    log.produce(TOPIC, 0, None, Bytes::from(r#"{"user":"bob"}"#))
        .unwrap();

    let consumer = MemoryConsumer::new(log.clone(), &settings.source);
    let sink = ObjectStoreSink::open(&settings.sink.output_location).unwrap();
    let (shutdown, watcher) = stop_when_committed(log.clone(), vec![(0, 2)]);
    let mut pipeline = Pipeline::new(settings, consumer, sink);
    let summary = tokio::time::timeout(Duration::from_secs(10), pipeline.run(shutdown))
        .await
        .unwrap()
        .unwrap();
    watcher.await.unwrap();
    assert_eq!(summary.rows_written, 2);

    let files: Vec<_> = std::fs::read_dir(lake.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&files[0])
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(
        lines,
        vec![
            serde_json::json!({"key": "u1", "user": "ann", "count": 3}),
            serde_json::json!({"user": "bob"}),
        ]
    );
}
