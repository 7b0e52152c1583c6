//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter engine errors that are not transport failures
    #[error("Counter engine error: {0}")]
    Engine(String),

    /// Redis transport or script errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The caller cancelled the request before the engine answered
    #[error("Rate limit check cancelled")]
    Cancelled,

    /// The per-call deadline elapsed before the engine answered
    #[error("Rate limit check exceeded its deadline")]
    DeadlineExceeded,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
