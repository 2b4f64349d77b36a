//! Unified error types for the mountmap-core library.
//!
//! Uses SNAFU for context-rich error handling. Validation problems are not
//! errors: they are reported as [`crate::validate::ValidationIssue`] values.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The mount point constraint catalog has not been loaded yet.
    ///
    /// Callers must treat this as "not ready" (a loading state), never as an
    /// empty catalog.
    #[snafu(display("mount point constraints are not available yet"))]
    ConstraintsUnavailable,

    /// No partitioning target has been loaded into the session.
    #[snafu(display("no partitioning target is loaded"))]
    NoPartitioning,

    /// The backend rejected or failed to apply the outgoing request list.
    #[snafu(display("failed to apply mount point requests to {target}: {message}"))]
    PersistFailure { target: String, message: String },

    /// An edit addressed a row that does not exist.
    #[snafu(display("request index {index} is out of range for {len} requests"))]
    EditIndexOutOfRange { index: usize, len: usize },

    /// The backend does not know the given partitioning target.
    #[snafu(display("unknown partitioning target '{target}'"))]
    UnknownTarget { target: String },

    /// The backend refused an operation.
    #[snafu(display("backend rejected '{operation}': {message}"))]
    BackendRejected { operation: String, message: String },

    /// Backend state file cannot be read.
    #[snafu(display("failed to read backend state at {}", path.display()))]
    StateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write the backend state file.
    #[snafu(display("failed to write backend state at {}", path.display()))]
    StateWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Backend state file is not valid JSON.
    #[snafu(display("failed to parse backend state at {}", path.display()))]
    StateParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Configuration file cannot be read.
    #[snafu(display("failed to read configuration at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON.
    #[snafu(display("failed to parse configuration at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Failed to spawn the backend daemon.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Failed to communicate with the backend daemon.
    #[snafu(display("session communication error: {message}"))]
    SessionCommunication { message: String },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

impl Error {
    /// Returns true if the error means "not loaded yet" rather than a failure.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::ConstraintsUnavailable | Error::NoPartitioning)
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for state file read errors.
    fn state_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for state file write errors.
    fn state_write_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn state_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(StateReadSnafu { path: path.into() })
    }

    fn state_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(StateWriteSnafu { path: path.into() })
    }
}
