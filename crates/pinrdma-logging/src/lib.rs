use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing::{debug, error, info, instrument, trace, warn};

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Minutely,
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(r: Rotation) -> Self {
        match r {
            Rotation::Minutely => rolling::Rotation::MINUTELY,
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `pinrdma_net_rdma=debug`.
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for rolling log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub rotation: Rotation,

    #[serde(default)]
    pub json_format: bool,

    #[serde(default = "default_true")]
    pub console_output: bool,

    /// Include the thread name on each line; useful when a server and a
    /// client session share one process.
    #[serde(default)]
    pub thread_names: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "pinrdma".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: Rotation::default(),
            json_format: false,
            console_output: true,
            thread_names: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("invalid log filter `{directive}`: {source}")]
    Filter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to create log file appender: {0}")]
    Appender(#[from] rolling::InitError),

    #[error("global subscriber already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer<S> = Box<dyn tracing_subscriber::Layer<S> + Send + Sync>;

fn build_filter(config: &LogConfig) -> Result<EnvFilter, LogInitError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|source| LogInitError::Filter {
        directive: config.level.clone(),
        source,
    })
}

/// Install the global subscriber.
///
/// The returned guard flushes the non-blocking file writer on drop and must
/// be held for the life of the program. `None` means no file output.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, LogInitError> {
    let env_filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer: Option<BoxedLayer<_>> = match (config.console_output, config.json_format) {
        (false, _) => None,
        (true, true) => Some(Box::new(fmt::layer().json().with_thread_names(config.thread_names))),
        (true, false) => Some(Box::new(fmt::layer().with_thread_names(config.thread_names))),
    };

    let (file_layer, guard): (Option<BoxedLayer<_>>, Option<WorkerGuard>) = match config.log_dir {
        Some(ref log_dir) => {
            let appender = rolling::RollingFileAppender::builder()
                .rotation(config.rotation.into())
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(log_dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer: BoxedLayer<_> = if config.json_format {
                Box::new(fmt::layer().json().with_ansi(false).with_writer(writer))
            } else {
                Box::new(fmt::layer().with_ansi(false).with_writer(writer))
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    registry.with(console_layer).with(file_layer).try_init()?;
    Ok(guard)
}
