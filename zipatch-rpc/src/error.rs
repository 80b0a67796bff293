//! Error types for the remote-control shim

use std::io;
use thiserror::Error;

/// Error types for engine calls and the wire protocol
#[derive(Error, Debug)]
pub enum Error {
    /// IO error on the transport
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed frame or payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request named an opcode this worker does not know
    #[error("Unknown opcode {0}")]
    UnknownOpcode(i32),

    /// The worker reported a failure
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// The worker process or task is gone
    #[error("Worker is no longer running")]
    WorkerGone,

    /// No installer has been constructed in this session
    #[error("No installer constructed")]
    NotConstructed,

    /// Patch index error
    #[error("Index error: {0}")]
    Index(#[from] zipatch_index::Error),

    /// Install error
    #[error("Install error: {0}")]
    Install(#[from] zipatch_install::Error),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a protocol error with context
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// Result type for engine calls
pub type Result<T> = std::result::Result<T, Error>;
