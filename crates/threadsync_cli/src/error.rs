//! CLI error type.

use std::path::PathBuf;
use thiserror::Error;
use threadsync_engine::SyncError;

/// Errors reported by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// A required setting was given neither as a flag nor in the config file.
    #[error("missing setting `{0}` (pass a flag or set it in the config file)")]
    MissingSetting(&'static str),

    /// The config file could not be read.
    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for the expected shape.
    #[error("invalid config file {path}: {source}")]
    ConfigParse {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The HTTP client could not be built.
    #[error("cannot build HTTP client: {0}")]
    HttpClient(String),

    /// A conflict resolution name was not recognised.
    #[error("unknown resolution `{0}` (expected pick-local, pick-remote or keep-both)")]
    UnknownResolution(String),

    /// An output format was not recognised.
    #[error("unknown output format `{0}` (expected text or json)")]
    UnknownFormat(String),

    /// Output could not be encoded.
    #[error("cannot encode output: {0}")]
    Encode(#[from] serde_json::Error),

    /// The engine failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
