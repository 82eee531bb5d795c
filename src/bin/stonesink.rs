use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use stonesink::service::{setup_local_tracing, setup_tracing};
use stonesink::{
    AppResult, KafkaConsumer, LogSource, MemoryConsumer, MemoryLog, ObjectStoreSink, Pipeline,
    PipelineConfig, PipelineSettings, Shutdown, MEMORY_BOOTSTRAP,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the validated configuration and exit
    PrintConfig,
    /// sink the configured topic; with `bootstrap_servers = "memory"` the
    /// topic is fed from `key<TAB>value` lines on stdin
    Run,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = PipelineConfig::set_up_config(config_path)?;
    let settings = config.validate()?;

    match commandline.command.unwrap_or(Command::Run) {
        Command::PrintConfig => {
            setup_local_tracing()?;
            println!("{}", render_settings(&settings));
            Ok(())
        }
        Command::Run => {
            let log_level = match commandline.verbose {
                0 => settings.log_level.clone(),
                1 => "info".to_string(),
                2 => "debug".to_string(),
                _ => "trace".to_string(),
            };
            let _log_guard = setup_tracing(&log_level, settings.log_dir.as_deref())?;

            let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
            let result = rt.block_on(run(settings));
            if let Err(err) = &result {
                error!("stonesink exited with error: {}", err);
            }
            result
        }
    }
}

fn render_settings(settings: &PipelineSettings) -> String {
    format!("{:#?}", settings)
}

async fn run(settings: PipelineSettings) -> AppResult<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let signal_tx = notify_shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping after the current batch");
            let _ = signal_tx.send(());
        }
    });

    if settings.source.bootstrap_servers != MEMORY_BOOTSTRAP {
        let consumer = KafkaConsumer::new(&settings.source)?;
        return drive(settings, consumer, &notify_shutdown).await;
    }

    let log = match &settings.source.checkpoint_dir {
        Some(dir) => MemoryLog::with_checkpoint_dir(dir).await?,
        None => MemoryLog::new(),
    };
    log.create_topic(&settings.source.topic, settings.source.partitions)?;
    let consumer = MemoryConsumer::new(log.clone(), &settings.source);
    let feeder = tokio::spawn(feed_stdin(
        log,
        settings.source.topic.clone(),
        settings.source.partitions,
        settings.source.batch_interval,
        notify_shutdown.clone(),
    ));
    let result = drive(settings, consumer, &notify_shutdown).await;
    feeder.abort();
    result
}

async fn drive<S: LogSource>(
    settings: PipelineSettings,
    consumer: S,
    notify_shutdown: &broadcast::Sender<()>,
) -> AppResult<()> {
    let sink = ObjectStoreSink::open(&settings.sink.output_location)?;
    let shutdown = Shutdown::new(notify_shutdown.subscribe());
    let mut pipeline = Pipeline::new(settings, consumer, sink);
    let summary = pipeline.run(shutdown).await?;
    info!(
        "sank {} records in {} batches, {} rows written",
        summary.records, summary.batches, summary.rows_written
    );
    Ok(())
}

/// Appends stdin lines round robin across partitions. At end of input, waits
/// for the remaining records to be picked up and then requests shutdown.
async fn feed_stdin(
    log: MemoryLog,
    topic: String,
    partitions: i32,
    batch_interval: Duration,
    notify_shutdown: broadcast::Sender<()>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_partition = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let (key, value) = match line.split_once('\t') {
                    Some((key, value)) => (Some(Bytes::from(key.to_string())), value.to_string()),
                    None => (None, line),
                };
                match log.produce(&topic, next_partition, key, Bytes::from(value)) {
                    Ok(offset) => debug!("produced {}-{} at {}", topic, next_partition, offset),
                    Err(err) => warn!("dropping input line: {}", err),
                }
                next_partition = (next_partition + 1) % partitions;
            }
            Ok(None) => break,
            Err(err) => {
                warn!("reading stdin: {}", err);
                break;
            }
        }
    }
    tokio::time::sleep(batch_interval * 2).await;
    info!("input exhausted, stopping");
    let _ = notify_shutdown.send(());
}
