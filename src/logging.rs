use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_ENV: &str = "STAYLINE_LOG";
const LOG_FILE_PREFIX: &str = "stayline.log";

/// STAYLINE_LOG wins over the configured level.
fn build_filter(default_level: &str) -> Result<EnvFilter> {
  match std::env::var(LOG_ENV) {
    Ok(directives) if !directives.is_empty() => EnvFilter::try_new(&directives)
      .map_err(|e| eyre!("Invalid {} '{}': {}", LOG_ENV, directives, e)),
    _ => EnvFilter::try_new(default_level)
      .map_err(|e| eyre!("Invalid log level '{}': {}", default_level, e)),
  }
}

/// Install the global subscriber.
///
/// Logs go to stderr, and to a daily-rotated file in `log_dir` when enabled. Keep
/// the returned guard alive until exit so buffered file output is flushed.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> Result<Option<WorkerGuard>> {
  let filter = build_filter(&config.level)?;
  let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let (file_layer, guard) = if config.file {
    std::fs::create_dir_all(log_dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    (
      Some(fmt::layer().with_writer(writer).with_ansi(false)),
      Some(guard),
    )
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

  Ok(guard)
}
