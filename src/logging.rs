use color_eyre::{eyre::eyre, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

/// Install the global subscriber: stderr always, plus a daily rolling file
/// when a directory is configured. Stdout carries responses only.
///
/// Hold the returned guard until exit so buffered file output is flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let level = parse_level(&config.level)?;
  let filter = || {
    EnvFilter::builder()
      .with_default_directive(level.into())
      .from_env_lossy()
  };

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(true)
    .with_filter(filter());

  let (file_layer, guard) = match &config.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "glq.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(true)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  tracing::debug!(level = %config.level, file_output = guard.is_some(), "logging initialized");
  Ok(guard)
}

fn parse_level(level: &str) -> Result<Level> {
  level
    .trim()
    .parse()
    .map_err(|_| eyre!("Invalid log level: {}", level))
}
