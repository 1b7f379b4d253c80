//! Error types for the scheduler.

use kiln_proto::ProtocolError;
use kiln_state::KvError;
use thiserror::Error;

use crate::auth::AuthError;

/// Scheduler errors.
///
/// None of these are fatal to the process. Each is reported to the peer that
/// caused it and, where a connection is involved, ends that connection only.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Malformed message, unknown type, or stray binary data.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The environment is already stored or being received.
    #[error("already got environment {0}")]
    DuplicateTransfer(String),

    /// Rejected compatibility-graph change.
    #[error("Bad change: {0}")]
    ConfigValidation(String),

    /// Authentication or authorisation failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The uploading connection went away before the final chunk.
    #[error("transfer of {0} interrupted")]
    TransferInterrupted(String),

    /// Disk failure in the environment store.
    #[error("storage error on {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Key-value store failure.
    #[error("state error: {0}")]
    State(#[from] KvError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The scheduler task has stopped.
    #[error("scheduler unavailable")]
    Unavailable,
}

impl SchedulerError {
    pub fn storage(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ConfigValidation(reason.into())
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
