//! # Loggers Module
//!
//! One-call `log` backend setup shared by every binary in the workspace.

/// fern dispatch to stdout and a rotated log file.
pub mod loggerlocal;

// --- Public API Re-exports ---
pub use loggerlocal::{parse_level, rotate_logs, setup_logging, LoggerError};
