//! Job submission payload: the durable message a user's job request
//! becomes on the bus.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resource ask attached to a job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Preferred GPU model, if any. Empty means any model.
    pub gpu_model: Option<String>,
    pub min_vram_mb: u64,
    pub gpu_count: u32,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    /// Estimated draw of the whole job, in watts.
    pub estimated_power_w: u32,
}

/// What the provider actually executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPayload {
    Container {
        image: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        volume_mounts: Vec<String>,
        #[serde(default)]
        gpu_access: bool,
    },
    Script {
        blob: String,
        language: String,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

/// A file the provider fetches before execution, or uploads after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
    pub url: String,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// The durable bus message representing a user's job request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_id: String,
    pub user_id: String,
    pub requirements: ResourceRequirements,
    pub execution: ExecutionPayload,
    /// Hard cost ceiling in token units.
    pub cost_ceiling: Decimal,
    pub max_duration_minutes: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub input_files: Vec<FileSpec>,
    #[serde(default)]
    pub output_files: Vec<FileSpec>,
    pub submitted_at: DateTime<Utc>,
    /// Free-form extensibility; never rate- or balance-affecting.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn sample_submission() -> JobSubmission {
        JobSubmission {
            job_id: "job-42".to_string(),
            user_id: "user-7".to_string(),
            requirements: ResourceRequirements {
                gpu_model: Some("RTX 4090".to_string()),
                min_vram_mb: 24_576,
                gpu_count: 1,
                cpu_cores: 8,
                memory_mb: 32_768,
                estimated_power_w: 450,
            },
            execution: ExecutionPayload::Container {
                image: "pytorch/pytorch:latest".to_string(),
                command: vec!["python".to_string(), "train.py".to_string()],
                env: HashMap::from([("EPOCHS".to_string(), "10".to_string())]),
                volume_mounts: vec![],
                gpu_access: true,
            },
            cost_ceiling: dec!(5.0),
            max_duration_minutes: 120,
            priority: 0,
            input_files: vec![FileSpec {
                url: "https://storage.example/input.tar".to_string(),
                target_path: "/workspace/input.tar".to_string(),
                checksum: Some("sha256:abc".to_string()),
            }],
            output_files: vec![],
            submitted_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_submission_round_trip() {
        let submission = sample_submission();
        let bytes = crate::encode(&submission).unwrap();
        let decoded: JobSubmission = crate::decode(&bytes).unwrap();
        assert_eq!(submission, decoded);
    }

    #[test]
    fn test_script_payload_round_trip() {
        let payload = ExecutionPayload::Script {
            blob: "print('hi')".to_string(),
            language: "python".to_string(),
            env: HashMap::new(),
        };
        let bytes = crate::encode(&payload).unwrap();
        let decoded: ExecutionPayload = crate::decode(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_malformed_payload_is_a_decode_error() {
        let result: Result<JobSubmission, _> = crate::decode(b"{not json");
        assert!(matches!(result, Err(crate::CodecError::Decode(_))));
    }
}
