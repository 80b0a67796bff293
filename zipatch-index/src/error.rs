//! Error types for patch index operations

use std::io;
use thiserror::Error;

/// Error types for building, serializing and reconstructing from a patch index
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A value does not fit the packed field it is stored in
    #[error("Value {value} too large for field {field}")]
    FieldOverflow {
        /// Name of the packed field
        field: &'static str,
        /// The rejected value
        value: u64,
    },

    /// A split offset was attached to a part that never goes through a decode stage
    #[error("Part at target offset {target_offset} is not deflated but carries a decoded-split offset")]
    SplitOnNonDeflated {
        /// Target offset of the offending part
        target_offset: u64,
    },

    /// Reconstruction was attempted for a part with no byte provenance
    #[error("Part at target offset {target_offset} has no source; reconstruction is impossible")]
    UnavailablePart {
        /// Target offset of the offending part
        target_offset: u64,
    },

    /// A part that requires patch file data was reconstructed without any
    #[error("Part at target offset {target_offset} requires source data")]
    SourceDataRequired {
        /// Target offset of the offending part
        target_offset: u64,
    },

    /// Source bytes did not produce the checksummed target bytes
    #[error("Source data for part at target offset {target_offset} failed verification")]
    SourceDataCorrupt {
        /// Target offset of the offending part
        target_offset: u64,
    },

    /// The source stream ended before the part's data was fully read
    #[error("Source data ended prematurely: expected {expected} bytes, got {got}")]
    ShortSourceData {
        /// Bytes required
        expected: u64,
        /// Bytes actually available
        got: u64,
    },

    /// A part has no checksum and no synthesizable content, so it cannot be verified
    #[error("Part at target offset {target_offset} is unverifiable; the index is missing its CRC32 pass")]
    Unverifiable {
        /// Target offset of the offending part
        target_offset: u64,
    },

    /// Malformed index file
    #[error("Invalid patch index: {0}")]
    InvalidIndexFormat(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for patch index operations
pub type Result<T> = std::result::Result<T, Error>;
