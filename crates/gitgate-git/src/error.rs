//! Git transport error types.

use thiserror::Error;

/// Errors that can occur while serving a smart HTTP request.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pkt-line format.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Unknown service name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The response stream was already finalized.
    #[error("response stream already finalized")]
    Finalized,

    /// The pack binary could not be started.
    #[error("{source} running command {command}")]
    Spawn {
        /// Command line that was attempted.
        command: String,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// Content decoding failed.
    #[error("failed to decode {encoding} request body: {source}")]
    Decode {
        /// Content encoding in use.
        encoding: &'static str,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// The request body stream failed.
    #[error("request body error: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
