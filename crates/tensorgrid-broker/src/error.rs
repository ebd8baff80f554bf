use rust_decimal::Decimal;
use tensorgrid_common::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Concurrent update on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: Decimal,
        required: Decimal,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Database error during {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: Box<sqlx::Error>,
    },

    #[error("Bus error during {operation}: {message}")]
    Bus { operation: String, message: String },

    #[error("Provider registry error: {message}")]
    Registry { message: String },

    #[error("Settlement service error: {message}")]
    Settlement { message: String },

    #[error("Malformed payload: {0}")]
    Codec(#[from] tensorgrid_protocol::CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] tensorgrid_common::error::ConfigurationError),

    #[error("General error: {0}")]
    General(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn database(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classify into the coarse taxonomy that handler boundaries act on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Validation { .. } | BrokerError::Codec(_) => ErrorKind::Validation,
            BrokerError::NotFound { .. } => ErrorKind::NotFound,
            BrokerError::Conflict { .. } => ErrorKind::Conflict,
            BrokerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            BrokerError::InvalidStateTransition { .. } => ErrorKind::Validation,
            BrokerError::Database { .. }
            | BrokerError::Bus { .. }
            | BrokerError::Registry { .. }
            | BrokerError::Settlement { .. } => ErrorKind::TransientInfra,
            BrokerError::Config(_) | BrokerError::General(_) => ErrorKind::PermanentInfra,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = BrokerError::validation("vram", "exceeds device capacity");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_transient());

        let err = BrokerError::Conflict {
            entity: "wallet",
            id: "w-1".to_string(),
        };
        assert!(err.is_transient());

        let err = BrokerError::Registry {
            message: "lookup timed out".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::TransientInfra);
        assert!(err.is_transient());
    }
}
