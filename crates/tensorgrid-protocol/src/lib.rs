//! Wire contracts for the Tensorgrid message bus.
//!
//! Every payload that crosses the bus is defined here as an explicit serde
//! struct. Consumers decode with [`decode`] and treat malformed input as a
//! poison pill rather than an infrastructure failure.

pub mod status;
pub mod subjects;
pub mod submission;
pub mod task;
pub mod usage;

pub use status::{TaskPhase, TaskStatusUpdate};
pub use submission::{ExecutionPayload, FileSpec, JobSubmission, ResourceRequirements};
pub use task::{CancelDirective, TaskDescriptor};
pub use usage::UsageReport;

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a payload for publication.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

/// Decode a payload delivered from the bus.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
