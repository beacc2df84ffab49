//! I/O and pipeline error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from ingest and pipeline setup.
#[derive(Error, Debug)]
pub enum Error {
    /// Host:port did not resolve to a usable address.
    #[error("invalid address {0}")]
    InvalidAddress(String),

    /// Configuration file or value rejected.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
