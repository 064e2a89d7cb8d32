//! # Logging
//!
//! Everything is logged through `tracing` into a plain text file, since the library runs inside another
//! process and has no console of its own.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// Log file name
pub const LOG_FILE: &str = "sigfix.log";

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "sigfix=debug";

/// Errors while setting up logging
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log file could not be opened
    #[error("Could not open {}: {source}", path.display())]
    Open {
        /// Log path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// Another subscriber is already installed
    #[error("{0}")]
    Install(#[from] SetGlobalDefaultError),
}

/// A subscriber writing plain lines with level and target to `file`
pub fn subscriber(file: File) -> impl Subscriber + Send + Sync {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .finish()
}

/// Appends to the log file at `path` and installs the global subscriber
pub fn init(path: &Path) -> Result<(), LoggingError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::subscriber::set_global_default(subscriber(file))?;
    Ok(())
}
