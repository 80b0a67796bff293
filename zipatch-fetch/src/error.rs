//! Error types for range downloads

use thiserror::Error;

/// Error types for range download operations
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The server answered with a status the range protocol does not allow
    #[error("Unexpected HTTP status {status}")]
    UnexpectedStatus {
        /// The offending status code
        status: u16,
    },

    /// The response body did not carry the requested ranges
    #[error("Transfer failed: {0}")]
    TransferFailure(String),

    /// Every retry attempt failed
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// The error of the final attempt
        last: Box<Error>,
    },
}

impl Error {
    /// Create a transfer failure with context
    pub fn transfer_failure(message: impl Into<String>) -> Self {
        Self::TransferFailure(message.into())
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_body() || e.is_request(),
            Self::UnexpectedStatus { status } => *status == 429 || *status >= 500,
            Self::TransferFailure(_) => true,
            Self::InvalidUrl(_) | Self::RetriesExhausted { .. } => false,
        }
    }
}

/// Result type for range download operations
pub type Result<T> = std::result::Result<T, Error>;
