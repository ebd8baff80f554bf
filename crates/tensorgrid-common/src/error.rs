//! Error types shared across Tensorgrid crates.

use thiserror::Error;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to parse configuration: {details}")]
    ParseError { details: String },

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed: {details}")]
    ValidationFailed { details: String },
}

/// Coarse classification of a failure, used at handler boundaries to decide
/// whether an operation is retried, surfaced, or marks the entity failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Entity absent.
    NotFound,
    /// Optimistic concurrency loss. Retried with jittered backoff.
    Conflict,
    /// Balance or ceiling guard tripped. Terminal for the operation.
    InsufficientFunds,
    /// Infrastructure failure that may succeed on retry.
    TransientInfra,
    /// Misconfiguration or contract violation in a collaborator.
    PermanentInfra,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::TransientInfra)
    }
}
