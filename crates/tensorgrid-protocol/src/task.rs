//! Dispatch payloads addressed to one provider.

use crate::submission::{ExecutionPayload, FileSpec, ResourceRequirements};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The full task descriptor a provider needs to execute a job.
///
/// Carried verbatim on `tasks.dispatch.{provider}.{job}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub job_id: String,
    pub user_id: String,
    pub session_id: String,
    pub execution: ExecutionPayload,
    pub requirements: ResourceRequirements,
    pub cost_ceiling: Decimal,
    pub estimated_cost: Decimal,
    pub max_duration_minutes: u32,
    #[serde(default)]
    pub input_files: Vec<FileSpec>,
    #[serde(default)]
    pub output_files: Vec<FileSpec>,
    /// Whether the provider wipes the workspace after upload.
    #[serde(default)]
    pub cleanup_workspace: bool,
    pub dispatched_at: DateTime<Utc>,
}

/// Published when a running or dispatched job must stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelDirective {
    pub job_id: String,
    pub session_id: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}
