//! Tracing setup shared by the server, the CLI, and the test suites.
//!
//! Events go to stdout through a compact formatter. A second, non-blocking file layer is added
//! unless `LIBRARIAN_LOG_FILE=off`:
//!
//! - `LIBRARIAN_LOG_FILE=<path>` appends to that file;
//! - otherwise a daily-rotated `librarian.log` is written under `LIBRARIAN_LOG_DIR` (default `logs`).
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const DEFAULT_LOG_DIR: &str = "logs";
const LOG_FILE_NAME: &str = "librarian.log";

/// Where file logs are written.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileTarget {
    Disabled,
    Append(PathBuf),
    DailyIn(PathBuf),
}

impl FileTarget {
    fn from_env() -> Self {
        match std::env::var("LIBRARIAN_LOG_FILE") {
            Ok(value) if value.eq_ignore_ascii_case("off") => Self::Disabled,
            Ok(value) if !value.trim().is_empty() => Self::Append(PathBuf::from(value)),
            _ => Self::DailyIn(
                std::env::var("LIBRARIAN_LOG_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR)),
            ),
        }
    }
}

/// Install the process-wide subscriber.
///
/// Respects `RUST_LOG` (defaults to `info`). Call once, before any worker starts.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match file_writer(FileTarget::from_env()) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

/// Install a subscriber that writes through the test harness; repeated calls are ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn file_writer(target: FileTarget) -> Option<NonBlocking> {
    let (writer, guard) = match target {
        FileTarget::Disabled => return None,
        FileTarget::Append(path) => match open_append(&path) {
            Ok(file) => tracing_appender::non_blocking(file),
            Err(err) => {
                eprintln!("Failed to open log file {}: {err}", path.display());
                return None;
            }
        },
        FileTarget::DailyIn(dir) => {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                eprintln!("Failed to create log directory {}: {err}", dir.display());
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_NAME))
        }
    };
    let _ = LOG_GUARD.set(guard);
    Some(writer)
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}
