//! Error types for verify and install operations

use std::io;
use thiserror::Error;

/// Error types for verify and install operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Patch index error
    #[error("Index error: {0}")]
    Index(#[from] zipatch_index::Error),

    /// Range download error
    #[error("Download error: {0}")]
    Fetch(#[from] zipatch_fetch::Error),

    /// An operation needed a target stream that was never attached
    #[error("No stream attached for target {path}")]
    StreamNotAttached {
        /// Install-relative path of the target
        path: String,
    },

    /// A repair operation hit a read-only target stream
    #[error("Target {path} is attached read-only")]
    NotWritable {
        /// Install-relative path of the target
        path: String,
    },

    /// The fetched source data never covered a queued part
    #[error("Source data for {path} at target offset {target_offset} was not delivered")]
    MissingTargetPart {
        /// Install-relative path of the target
        path: String,
        /// Offset of the part that stayed missing
        target_offset: u64,
    },

    /// An index part is structurally unverifiable; the index is malformed
    #[error("Target {path} contains an unverifiable part at offset {target_offset}")]
    UnverifiablePart {
        /// Install-relative path of the target
        path: String,
        /// Offset of the offending part
        target_offset: u64,
    },

    /// One or more independent install jobs failed
    #[error("{count} install job(s) failed")]
    JobsFailed {
        /// Number of failed jobs
        count: usize,
        /// The individual failures
        failures: Vec<Error>,
    },

    /// The index has no sources, so no version string exists
    #[error("Index has no terminal patch to derive a version from")]
    NoVersionName,

    /// A worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Task(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn jobs_failed(failures: Vec<Error>) -> Self {
        Self::JobsFailed {
            count: failures.len(),
            failures,
        }
    }
}

/// Result type for verify and install operations
pub type Result<T> = std::result::Result<T, Error>;
