use std::path::Path;

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::AppResult;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Keeps the non-blocking file writer alive; flushes on drop.
pub struct LogGuard {
    _worker_guard: Option<WorkerGuard>,
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Console-only tracing, used by tests and the `print-config` command.
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    // a second init in the same process (tests) is not an error
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter("info"))
        .try_init();
    Ok(())
}

/// Console tracing at `log_level` (overridden by `RUST_LOG`), optionally
/// duplicated into an hourly rolling file under `log_dir`.
pub fn setup_tracing(log_level: &str, log_dir: Option<&Path>) -> AppResult<LogGuard> {
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::hourly(dir, "stonesink.log");
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
            let writer = non_blocking.and(std::io::stdout);
            tracing_subscriber::registry()
                .with(fmt_layer.with_ansi(false).with_writer(writer))
                .with(env_filter(log_level))
                .init();
            Ok(LogGuard {
                _worker_guard: Some(worker_guard),
            })
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt_layer.with_ansi(true))
                .with(env_filter(log_level))
                .init();
            Ok(LogGuard {
                _worker_guard: None,
            })
        }
    }
}
