//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level. When a log file is
//! given, events are also written to it through a non-blocking appender; the
//! returned guard must be held for as long as logging is needed.

use crate::config::{LogFormat, LogLevel};
use crate::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Build the filter from `RUST_LOG`, falling back to `level`
pub fn env_filter(level: LogLevel) -> EnvFilter {
    let level = tracing::Level::from(level).to_string().to_lowercase();
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", level)))
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Plain => fmt::layer().with_target(false).boxed(),
    }
}

fn file_layer(path: &Path) -> Result<(BoxedLayer, WorkerGuard)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::config(format!("Invalid log file path: {}", path.display())))?;
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory)?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    // Files always get JSON lines without ANSI colours
    let layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .boxed();
    Ok((layer, guard))
}

/// Install the global subscriber
pub fn init_logging(
    level: LogLevel,
    format: LogFormat,
    file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let mut layers = vec![console_layer(format)];

    let guard = match file {
        Some(path) => {
            let (layer, guard) = file_layer(path)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(level))
        .try_init()
        .map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_layer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("supervisor.log");

        let (_layer, _guard) = file_layer(&path).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_file_layer_rejects_directory_path() {
        assert!(file_layer(Path::new("/")).is_err());
    }
}
