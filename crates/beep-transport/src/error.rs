//! Transport errors.

use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Tuning handshake failed
    #[error("Tuning reset failed: {0}")]
    Tuning(String),

    /// Session or protocol failure
    #[error(transparent)]
    Session(#[from] beep_core::Error),

    /// The driver task panicked or was cancelled
    #[error("Driver task failed: {0}")]
    Task(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
