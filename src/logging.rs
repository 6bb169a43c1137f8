//! Logging configuration for DbRheo.
//!
//! Interactive sessions log to a file so streamed model output stays clean;
//! headless runs log to stderr for easy capture.

use std::fs::{self, File};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Initializes logging for interactive mode.
///
/// Logs are written to `~/.local/state/dbrheo/dbrheo.log` on Linux (XDG
/// state directory), or the platform-appropriate state/config directory on
/// other systems.
pub fn init_file_logging(debug: bool) {
    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory: {e}");
            return;
        }
    }

    // Truncate on each run to avoid unbounded growth.
    let log_file = match File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file: {e}");
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(default_filter(debug))
        .with_writer(log_file)
        .with_ansi(false)
        .init();
}

/// Initializes logging for headless mode, writing to stderr.
pub fn init_stderr_logging(debug: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(debug))
        .init();
}

fn default_filter(debug: bool) -> EnvFilter {
    let fallback = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Returns the path for the log file.
pub fn get_log_path() -> PathBuf {
    if let Some(state_dir) = dirs::state_dir() {
        return state_dir.join("dbrheo").join("dbrheo.log");
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("dbrheo").join("dbrheo.log");
    }

    std::env::temp_dir().join("dbrheo.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_is_absolute() {
        let path = get_log_path();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_log_path_ends_with_dbrheo_log() {
        let path = get_log_path();
        assert!(path.ends_with("dbrheo.log"));
    }
}
