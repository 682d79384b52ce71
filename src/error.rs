//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limiter or file configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker behind a limiter handle has stopped
    #[error("Rate limiter worker is no longer running")]
    LimiterClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
