//! Tracing subscriber set-up for the binary.
//!
//! Library code only emits events; installing the subscriber is left to the
//! binary so tests and embedders keep control of their own output.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Why logging could not be set up.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log file could not be opened for appending.
    #[error("cannot open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The level or directive did not parse.
    #[error("invalid log filter '{0}'")]
    Filter(String),
    /// Another subscriber owns the global default.
    #[error("a global subscriber is already installed")]
    AlreadyInstalled,
}

/// Filter from the command line level, else `RUST_LOG`, else the configured level.
pub fn filter(cli_level: Option<&str>, config_level: &str) -> Result<EnvFilter, LoggingError> {
    match cli_level {
        Some(level) => EnvFilter::try_new(level).map_err(|_| LoggingError::Filter(level.to_string())),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(config_level))
            .map_err(|_| LoggingError::Filter(config_level.to_string())),
    }
}

/// Installs the global fmt subscriber, writing to `file` (appending, no ANSI) when given.
pub fn init(filter: EnvFilter, file: Option<&Path>) -> Result<(), LoggingError> {
    let installed = match file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.display().to_string(),
                    source,
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };
    installed.map_err(|_| LoggingError::AlreadyInstalled)
}
