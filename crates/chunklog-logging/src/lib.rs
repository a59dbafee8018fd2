//! Structured logging for chunklog
//!
//! Sets up a `tracing` subscriber with console output (pretty or JSONL) and
//! optional rotating JSONL files, driven by a serde-friendly [`LogConfig`].
//!
//! # Quick Start
//!
//! ```ignore
//! use chunklog_logging::{LogConfig, SubscriberBuilder};
//!
//! // JSONL to the console with defaults
//! let _guard = SubscriberBuilder::new().init()?;
//!
//! // Human-readable output while developing
//! let _guard = SubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```
//!
//! `RUST_LOG`, when set, replaces the configured default level and target
//! overrides. Keep the returned [`LogGuard`] alive for as long as file
//! output should keep flowing.

pub mod config;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};

use std::fs::{self, File};

use thiserror::Error;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Errors raised while building or installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("log file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to create rolling log file: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

pub type LoggingResult<T> = Result<T, LoggingError>;

type Base = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync + 'static>;

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard")
            .field("file", &self._file.is_some())
            .finish()
    }
}

/// Builder for configuring and initializing the chunklog subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable output.
#[derive(Debug, Clone, Default)]
pub struct SubscriberBuilder {
    config: LogConfig,
}

impl SubscriberBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Build the subscriber without installing it
    ///
    /// Useful with `tracing::subscriber::with_default` in tests.
    pub fn build(self) -> LoggingResult<(impl Subscriber + Send + Sync + 'static, LogGuard)> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.directives())?,
        };

        let mut layers: Vec<BoxedLayer> = Vec::new();
        if self.config.console.enabled {
            layers.push(self.console_layer()?);
        }

        let mut file_guard = None;
        if let Some(file_config) = &self.config.file {
            let (writer, guard) = file_writer(file_config)?;
            file_guard = Some(guard);
            layers.push(self.json_layer(writer));
        }

        let subscriber = Registry::default().with(env_filter).with(layers);
        Ok((subscriber, LogGuard { _file: file_guard }))
    }

    /// Install the subscriber globally
    ///
    /// Fails if a global subscriber has already been set.
    pub fn init(self) -> LoggingResult<LogGuard> {
        let (subscriber, guard) = self.build()?;
        subscriber.try_init()?;
        Ok(guard)
    }

    fn console_layer(&self) -> LoggingResult<BoxedLayer> {
        let console = &self.config.console;
        let layer: BoxedLayer = if console.pretty {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_writer(std::io::stderr)
                .boxed()
        } else {
            let jsonl = &self.config.jsonl;
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
                .with_writer(std::io::stderr)
                .boxed()
        };

        match &console.level {
            Some(level) => Ok(layer.with_filter(EnvFilter::try_new(level)?).boxed()),
            None => Ok(layer),
        }
    }

    fn json_layer(&self, writer: NonBlocking) -> BoxedLayer {
        let jsonl = &self.config.jsonl;
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(jsonl.include_spans)
            .flatten_event(jsonl.flatten_events)
            .with_file(jsonl.include_location)
            .with_line_number(jsonl.include_location)
            .with_ansi(false)
            .with_writer(writer)
            .boxed()
    }
}

/// Open the file sink; `Never` truncates a single file, the others roll
fn file_writer(config: &FileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.directory)?;
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let path = config.directory.join(format!("{}.log", config.prefix));
            let file = File::create(path)?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder.build(&config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}
