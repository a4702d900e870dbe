//! Error types for coqtop-core.

use thiserror::Error;

use crate::protocol::types::ErrorInfo;

/// Result type alias using coqtop-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a verifier session.
#[derive(Error, Debug)]
pub enum Error {
    /// Subprocess communication error (spawn, pipe write, pipe read)
    #[error("Subprocess communication error: {0}")]
    SubprocessComm(String),

    /// Malformed or unexpected tagged value on the wire
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// The verifier refused a sentence or query
    #[error("Verifier rejected the request: {}", .0.message)]
    Rejected(ErrorInfo),

    /// The verifier process is gone; the session is stopped
    #[error("Verifier process exited: {reason}")]
    ProcessExited { reason: String },

    /// A rewind asked for more history than the session holds
    #[error("Cannot rewind {requested} step(s): only {available} committed")]
    RewindInconsistent { requested: usize, available: usize },

    /// The verifier answered in a way that leaves the history unknown
    #[error("Session aborted: {0}")]
    Aborted(String),

    /// The request was dropped by a cancellation before it was dispatched
    #[error("Request cancelled before dispatch")]
    Cancelled,

    /// The session is not in a state that accepts this operation
    #[error("Session not ready: {0}")]
    NotReady(String),

    /// The verifier version has no matching protocol dialect
    #[error("Unsupported verifier version: {0}")]
    UnsupportedVersion(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::ProtocolDecode(message.into())
    }

    /// Create a process-exited error.
    pub fn process_exited(reason: impl Into<String>) -> Self {
        Self::ProcessExited {
            reason: reason.into(),
        }
    }

    /// Create a rewind-inconsistent error.
    pub fn rewind_inconsistent(requested: usize, available: usize) -> Self {
        Self::RewindInconsistent {
            requested,
            available,
        }
    }

    /// Create a subprocess communication error with the io error folded in.
    pub fn subprocess(context: &str, source: std::io::Error) -> Self {
        Self::SubprocessComm(format!("{context}: {source}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("session lock poisoned: {err}"))
    }
}
