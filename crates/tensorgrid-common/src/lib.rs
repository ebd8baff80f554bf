//! Shared primitives for Tensorgrid services.

pub mod error;
pub mod logging;
pub mod types;

pub use error::ConfigurationError;
pub use types::LocationTag;
