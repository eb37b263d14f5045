//! File logging for the CLI.
//!
//! Stdout carries command output, so diagnostics go to a daily-rolling file
//! under the data directory. `TICKET_TIMER_DEBUG_LOG=1` raises the level.

use std::env;

use timer_core::StoragePaths;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "ticket-timer.log";

/// Returns the writer guard; logs written after it drops are lost.
pub fn init() -> Option<WorkerGuard> {
    let paths = StoragePaths::from_env().ok()?;
    let logs_dir = paths.logs_dir();
    fs_err::create_dir_all(&logs_dir).ok()?;

    let appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}

fn debug_enabled() -> bool {
    env::var("TICKET_TIMER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}
