//! Logging setup for binaries and test harnesses embedding db-execfilter.
//!
//! The library only emits `tracing` events. These helpers install a
//! `tracing-subscriber` writing to stderr or to a log file under the platform
//! state directory; `RUST_LOG` controls the filter.

use std::fs::{self, File};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Writes log events to the file at [`get_log_path`].
///
/// Location: `~/.local/state/db-execfilter/db-execfilter.log` on Linux, or the
/// platform-appropriate state/config directory elsewhere.
pub fn init_file_logging() {
    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory: {e}");
            return;
        }
    }

    // Truncated on each run.
    let log_file = match File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file: {e}");
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(log_file)
        .with_ansi(false)
        .try_init();
}

/// Writes log events to stderr.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_stderr_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Returns the path for the log file.
pub fn get_log_path() -> PathBuf {
    if let Some(state_dir) = dirs::state_dir() {
        return state_dir.join("db-execfilter").join("db-execfilter.log");
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("db-execfilter").join("db-execfilter.log");
    }

    std::env::temp_dir().join("db-execfilter.log")
}
