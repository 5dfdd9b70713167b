//! Tracing setup: a daily-rotated text log, a daily-rotated JSON log and
//! compact stdout, all filtered by `RUST_LOG` (default `info`).
//!
//! Scheduling outcomes are logged under their own targets so they can be
//! filtered apart from the rest:
//! - `uri_processing`: one line per final disposition
//! - `local_errors`: errors the fetcher attached to a URI
//! - `runtime_errors`: panics caught in workers
//! - `frontier`: queue lifecycle (debug)

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

pub const TEXT_LOG_FILENAME: &str = "frontier.log";
pub const JSON_LOG_FILENAME: &str = "frontier.json.log";

/// Keeps the background log writers alive. Dropping it flushes and stops them.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _text: WorkerGuard,
    _json: WorkerGuard,
}

/// Install the global subscriber writing into `log_dir`.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let (text_writer, text_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_path, TEXT_LOG_FILENAME));
    let (json_writer, json_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_path, JSON_LOG_FILENAME));

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter.clone());

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_thread_names(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()?;

    tracing::info!("Logging to {}", log_path.display());
    Ok(LoggingGuard {
        _text: text_guard,
        _json: json_guard,
    })
}

/// `init_logging` into the `logs` directory under a crawl's data dir.
pub fn init_logging_in_data_dir<P: AsRef<Path>>(
    data_dir: P,
) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    init_logging(data_dir.as_ref().join(Config::LOG_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_files_land_in_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        // Only one test in the process may install the global subscriber.
        let guard = init_logging_in_data_dir(temp_dir.path()).unwrap();
        tracing::info!(target: "uri_processing", uri = "http://a.test/", "finished");
        drop(guard);

        let log_dir = temp_dir.path().join(Config::LOG_DIR);
        let names: Vec<String> = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with(TEXT_LOG_FILENAME)));
        assert!(names.iter().any(|n| n.starts_with(JSON_LOG_FILENAME)));
    }
}
