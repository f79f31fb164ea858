//! Error types for the Breakwater engine.

use thiserror::Error;

/// Main error type for Breakwater operations.
#[derive(Error, Debug)]
pub enum BreakwaterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed rule, identifier, or out-of-policy duration. Rejected
    /// before any state mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The counter store is unreachable, timed out, or walled off by the
    /// circuit breaker.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unknown IP, user, or rule referenced by a status query.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Destructive bulk operation attempted without its confirmation token.
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Breakwater operations.
pub type Result<T> = std::result::Result<T, BreakwaterError>;
