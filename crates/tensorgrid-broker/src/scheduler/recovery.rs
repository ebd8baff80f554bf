//! Restart recovery and the stuck-job watchdog.
//!
//! On start the scheduler republishes retryable jobs through its own
//! pipeline. Dispatched and Running jobs are left alone; their status
//! streams resolve them, and the watchdog fails the ones that never
//! report back within their max-duration window.

use crate::domain::{EndReason, Job, JobState};
use crate::error::Result;
use crate::scheduler::pipeline::{NO_RETRY_KEY, NO_RETRY_VALUE};
use crate::scheduler::Scheduler;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tensorgrid_protocol::{self as protocol, JobSubmission};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECOVERY_BATCH: i64 = 500;

impl Scheduler {
    /// Startup sweep: put every retryable job back on the submission
    /// queue. Returns how many were republished.
    pub async fn recover(&self) -> Result<usize> {
        let candidates = self
            .store()
            .get_retryable_jobs(self.config().scheduler.retry_ceiling, RECOVERY_BATCH)
            .await?;

        let mut republished = 0;
        for mut job in candidates {
            if job.metadata.get(NO_RETRY_KEY).map(String::as_str) == Some(NO_RETRY_VALUE) {
                continue;
            }

            if job.state != JobState::Pending {
                job.transition_to(JobState::Pending)?;
                self.store().save_job(&job).await?;
            }

            let submission = submission_from_job(&job);
            let payload = protocol::encode(&submission)?;
            self.bus().publish_submission(&payload).await?;
            republished += 1;
            debug!(job = %job.id, attempts = job.attempts, "job republished for retry");
        }

        if republished > 0 {
            info!(count = republished, "retryable jobs republished after restart");
        }
        Ok(republished)
    }

    /// Periodically fail in-flight jobs whose last update is older than
    /// their max-duration window, settling their sessions.
    pub(crate) fn spawn_watchdog(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config().watchdog_interval());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = scheduler.watchdog_pass().await {
                    error!(error = %e, "watchdog pass failed");
                }
            }
            debug!("watchdog stopped");
        })
    }

    pub async fn watchdog_pass(&self) -> Result<usize> {
        let now = Utc::now();
        let inflight = self.store().get_inflight_jobs_before(now).await?;

        let mut failed = 0;
        for mut job in inflight {
            let deadline =
                job.updated_at + Duration::minutes(job.max_duration_minutes.max(1) as i64);
            if now < deadline {
                continue;
            }

            warn!(
                job = %job.id,
                state = %job.state,
                last_update = %job.updated_at,
                "no status within the max-duration window; failing job"
            );

            job.last_error = Some("no status from provider within max duration".to_string());
            job.metadata
                .insert(NO_RETRY_KEY.to_string(), NO_RETRY_VALUE.to_string());
            job.transition_to(JobState::Failed)?;
            self.store().save_job(&job).await?;

            if let Some(session) = self.store().get_session_by_job(&job.id).await? {
                if let Err(e) = self.billing().end_session(session.id, EndReason::Forced).await {
                    error!(
                        job = %job.id,
                        session = %session.id,
                        error = %e,
                        "watchdog settlement failed"
                    );
                }
            }
            failed += 1;
        }

        Ok(failed)
    }
}

/// Rebuild the wire submission from a persisted job for republication.
pub(crate) fn submission_from_job(job: &Job) -> JobSubmission {
    JobSubmission {
        job_id: job.id.to_string(),
        user_id: job.user_id.to_string(),
        requirements: job.requirements.clone(),
        execution: job.execution.clone(),
        cost_ceiling: job.cost_ceiling.as_decimal(),
        max_duration_minutes: job.max_duration_minutes,
        priority: job.priority,
        input_files: job.input_files.clone(),
        output_files: job.output_files.clone(),
        submitted_at: job.submitted_at,
        metadata: job.metadata.clone(),
    }
}
