use crate::domain::types::{JobId, ProviderId, TokenAmount, UserId};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tensorgrid_protocol::{ExecutionPayload, FileSpec, JobSubmission, ResourceRequirements};

/// Scheduling state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Searching,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether a job in this state has been handed to a provider.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, JobState::Dispatched | JobState::Running)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Searching)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Searching, JobState::Dispatched)
                | (JobState::Searching, JobState::Pending)
                | (JobState::Searching, JobState::Failed)
                | (JobState::Searching, JobState::Cancelled)
                | (JobState::Dispatched, JobState::Running)
                | (JobState::Dispatched, JobState::Completed)
                | (JobState::Dispatched, JobState::Failed)
                | (JobState::Dispatched, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
                // Retry path, taken only for transient failure reasons and
                // while the attempt count is below the retry ceiling.
                | (JobState::Failed, JobState::Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Searching => "searching",
            JobState::Dispatched => "dispatched",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "searching" => Ok(JobState::Searching),
            "dispatched" => Ok(JobState::Dispatched),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// A compute job: immutable user intent plus mutable scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub requirements: ResourceRequirements,
    pub execution: ExecutionPayload,
    pub cost_ceiling: TokenAmount,
    pub max_duration_minutes: u32,
    pub priority: i32,
    pub input_files: Vec<FileSpec>,
    pub output_files: Vec<FileSpec>,
    pub metadata: HashMap<String, String>,

    pub state: JobState,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub assigned_provider: Option<ProviderId>,
    /// Providers this job already failed on within the current retry window.
    pub attempted_providers: Vec<ProviderId>,
    pub progress_percent: u8,
    pub stage: Option<String>,

    pub submitted_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build the initial record from a decoded submission.
    pub fn from_submission(submission: JobSubmission) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(submission.job_id),
            user_id: UserId::new(submission.user_id),
            requirements: submission.requirements,
            execution: submission.execution,
            cost_ceiling: TokenAmount::from_decimal(submission.cost_ceiling),
            max_duration_minutes: submission.max_duration_minutes,
            priority: submission.priority,
            input_files: submission.input_files,
            output_files: submission.output_files,
            metadata: submission.metadata,
            state: JobState::Pending,
            last_error: None,
            attempts: 0,
            assigned_provider: None,
            attempted_providers: Vec::new(),
            progress_percent: 0,
            stage: None,
            submitted_at: submission.submitted_at,
            received_at: now,
            updated_at: now,
        }
    }

    pub fn transition_to(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BrokerError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a scheduling failure. The attempt count is monotonic.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn assign_provider(&mut self, provider: ProviderId) {
        if !self.attempted_providers.contains(&provider) {
            self.attempted_providers.push(provider.clone());
        }
        self.assigned_provider = Some(provider);
        self.updated_at = Utc::now();
    }

    pub fn clear_assignment(&mut self) {
        self.assigned_provider = None;
        self.updated_at = Utc::now();
    }

    pub fn has_attempted(&self, provider: &ProviderId) -> bool {
        self.attempted_providers.contains(provider)
    }
}


#[cfg(test)]
pub(crate) fn submission_fixture() -> JobSubmission {
    use rust_decimal_macros::dec;
    JobSubmission {
        job_id: "job-test".to_string(),
        user_id: "user-test".to_string(),
        requirements: ResourceRequirements {
            gpu_model: Some("RTX 4090".to_string()),
            min_vram_mb: 24_576,
            gpu_count: 1,
            cpu_cores: 8,
            memory_mb: 32_768,
            estimated_power_w: 450,
        },
        execution: ExecutionPayload::Script {
            blob: "echo ok".to_string(),
            language: "bash".to_string(),
            env: HashMap::new(),
        },
        cost_ceiling: dec!(5.0),
        max_duration_minutes: 120,
        priority: 0,
        input_files: vec![],
        output_files: vec![],
        submitted_at: Utc::now(),
        metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_transitions_follow_the_arrows() {
        assert!(JobState::Pending.can_transition_to(JobState::Searching));
        assert!(JobState::Searching.can_transition_to(JobState::Dispatched));
        assert!(JobState::Searching.can_transition_to(JobState::Pending));
        assert!(JobState::Dispatched.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(JobState::Failed.can_transition_to(JobState::Pending));

        // No shortcuts
        assert!(!JobState::Pending.can_transition_to(JobState::Dispatched));
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
        assert!(!JobState::Dispatched.can_transition_to(JobState::Pending));
    }

    #[test]
    fn test_completed_and_cancelled_never_transition_out() {
        for next in [
            JobState::Pending,
            JobState::Searching,
            JobState::Dispatched,
            JobState::Running,
            JobState::Failed,
        ] {
            assert!(!JobState::Completed.can_transition_to(next));
            assert!(!JobState::Cancelled.can_transition_to(next));
        }
        assert!(!JobState::Completed.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Completed));
    }

    #[test]
    fn test_attempt_count_is_monotonic() {
        let mut job = Job::from_submission(super::submission_fixture());
        assert_eq!(job.attempts, 0);
        job.record_failure("no suitable provider");
        job.record_failure("dispatch publish failed");
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("dispatch publish failed"));
    }
}
