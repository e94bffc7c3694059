//! # Local Logger
//!
//! Installs a `fern` dispatch as the global `log` backend:
//!
//! ```text
//! [2025-06-01 10:30:00][lib_sensornet::ingestors::gateway][WARN] Dropping malformed payload ...
//! ```
//!
//! Output goes to stdout and to `<log_dir>/<app>_<YYYY-mm-dd_HH-MM-SS>.log`.
//! Older log files of the same application are deleted on start-up so only
//! the newest previous run is kept next to the current one.

use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use thiserror::Error;

/// Errors raised while installing the logger.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory or file could not be created.
    #[error("log file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A global logger was already installed.
    #[error("logger already initialised: {0}")]
    Init(#[from] log::SetLoggerError),
}

/// Maps a level name to a filter. Unknown names mean `info`.
pub fn parse_level(level: &str) -> log::LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Deletes all but the newest `keep` log files of `app_name` in `log_dir`.
///
/// File names embed a sortable timestamp, so name order is age order.
/// Returns the number of files removed.
pub fn rotate_logs(log_dir: &Path, app_name: &str, keep: usize) -> usize {
    let pattern = format!("{}/{}_*.log", log_dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("Invalid log rotation pattern {}: {}", pattern, e);
            return 0;
        }
    };

    // Newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", old_file.display(), e),
        }
    }
    removed
}

/// Installs the global logger and returns the path of the new log file.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<PathBuf, LoggerError> {
    fs::create_dir_all(log_dir)?;
    rotate_logs(log_dir, app_name, 1);

    let log_file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        // Keep third-party protocol chatter out of debug sessions.
        .level_for("rumqttc", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}
