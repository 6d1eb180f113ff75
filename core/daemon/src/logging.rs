//! Log setup: stderr always, plus an optional plain-text file sink.

use fs_err as fs;
use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use agent_core::LoggingConfig;

const DEBUG_ENV: &str = "HPCAAS_DEBUG_LOG";
const DEFAULT_LEVEL: &str = "info";

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = build_filter(debug_forced(), config.level.as_deref());

    let (file_layer, guard) = match config.file.as_deref().map(file_writer) {
        Some(Ok((writer, guard))) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        Some(Err(err)) => {
            eprintln!("hpcaas-daemon: log file unavailable, logging to stderr only: {}", err);
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

fn debug_forced() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn build_filter(debug: bool, configured: Option<&str>) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = configured.unwrap_or(DEFAULT_LEVEL);
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    })
}

fn file_writer(
    path: &Path,
) -> std::io::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("log path has no file name: {}", path.display()),
        )
    })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_writer_rejects_path_without_file_name() {
        assert!(file_writer(Path::new("/")).is_err());
    }

    #[test]
    fn file_writer_creates_parent_directory() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("logs").join("agent.log");

        let (_writer, _guard) = file_writer(&path).expect("writer");
        assert!(temp_dir.path().join("logs").is_dir());
    }
}
