//! Error types for the sharedl library
//!
//! Provides comprehensive error handling for resolution, probing, transfer
//! and verification failures.

use std::fmt;

/// Main error type for sharedl operations
#[derive(Debug)]
pub enum Error {
    /// Share URL could not be converted to a direct download URL
    Resolution(String),

    /// Metadata probe (HEAD request) failed
    Probe(String),

    /// A chunk could not be fetched after exhausting all retries
    ChunkFetch(String),

    /// Downloaded file size does not match the probed size
    SizeMismatch { expected: u64, actual: u64 },

    /// Computed file hash does not match the expected hash
    HashMismatch { expected: String, actual: String },

    /// HTTP-specific error (unexpected status, malformed response)
    Http(String),

    /// Network connectivity issues (connect failures, timeouts)
    Network(String),

    /// File I/O error
    Io(std::io::Error),

    /// Invalid configuration or parameters
    InvalidInput(String),

    /// The download was cancelled by the caller
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Resolution(msg) => {
                write!(f, "Failed to resolve share URL: {}", msg)
            }
            Error::Probe(msg) => {
                write!(f, "Failed to probe file metadata: {}", msg)
            }
            Error::ChunkFetch(msg) => {
                write!(f, "Chunk download failed: {}", msg)
            }
            Error::SizeMismatch { expected, actual } => {
                write!(f, "File size mismatch: expected {}, got {}", expected, actual)
            }
            Error::HashMismatch { expected, actual } => {
                write!(f, "Hash verification failed: expected {}, got {}", expected, actual)
            }
            Error::Http(msg) => {
                write!(f, "HTTP error: {}", msg)
            }
            Error::Network(msg) => {
                write!(f, "Network error: {}", msg)
            }
            Error::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            Error::InvalidInput(msg) => {
                write!(f, "Invalid input: {}", msg)
            }
            Error::Cancelled => {
                write!(f, "Download cancelled")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::Network(err.to_string())
        } else {
            Error::Http(err.to_string())
        }
    }
}

/// Convenience result type for sharedl operations
pub type Result<T> = std::result::Result<T, Error>;
