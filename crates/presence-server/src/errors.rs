//! Server error types.

use thiserror::Error;

/// Errors that can occur while starting or running the relay.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the TCP listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The HTTP server stopped with an I/O error.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
    /// The configured client origin is not a valid header value.
    #[error("invalid client origin: {0}")]
    InvalidOrigin(String),
    /// The tracing subscriber could not be installed.
    #[error("failed to initialize logging: {0}")]
    Logging(String),
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
