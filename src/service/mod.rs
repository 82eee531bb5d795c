pub use app_error::{AppError, AppResult};
pub use config::{
    FormatConfig, GeneralConfig, PipelineConfig, PipelineSettings, SinkConfig, SinkSettings,
    SourceConfig, SourceSettings, ENV_PREFIX,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
