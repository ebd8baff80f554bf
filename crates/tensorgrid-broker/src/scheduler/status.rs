//! Status-stream ingestion: fold provider progress events into the job
//! record and finalize on terminal phases. User-initiated cancellation
//! also arrives on this channel.

use crate::billing::BillingEvent;
use crate::domain::{EndReason, JobId, JobState};
use crate::error::Result;
use crate::scheduler::pipeline::{NO_RETRY_KEY, NO_RETRY_VALUE};
use crate::scheduler::Scheduler;
use chrono::Utc;
use std::sync::Arc;
use tensorgrid_protocol::{self as protocol, CancelDirective, TaskPhase, TaskStatusUpdate};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

impl Scheduler {
    pub(crate) fn spawn_status_consumer(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            let mut subscription = scheduler.bus().subscribe_status().await;
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = subscription.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let update: TaskStatusUpdate = match protocol::decode(&message.payload) {
                    Ok(update) => update,
                    Err(e) => {
                        warn!(subject = %message.subject, error = %e, "malformed status update dropped");
                        continue;
                    }
                };

                if let Err(e) = scheduler.handle_status(update).await {
                    error!(error = %e, "status update handling failed");
                }
            }
            debug!("status consumer stopped");
        })
    }

    pub async fn handle_status(&self, update: TaskStatusUpdate) -> Result<()> {
        let job_id = JobId::new(update.job_id.clone());
        let Some(mut job) = self.store().get_job(&job_id).await? else {
            warn!(job = %job_id, "status update for unknown job dropped");
            return Ok(());
        };

        if job.state.is_terminal() {
            return Ok(());
        }

        // Fold progress regardless of phase
        job.progress_percent = update.progress_percent.min(100);
        if let Some(stage) = &update.stage {
            job.stage = Some(stage.clone());
        }
        if let Some(message) = &update.message {
            job.metadata
                .insert("last_message".to_string(), message.clone());
        }

        match update.phase {
            TaskPhase::Accepted | TaskPhase::Preparing => {
                self.store().save_job(&job).await?;
            }
            TaskPhase::Running => {
                if job.state == JobState::Dispatched {
                    job.transition_to(JobState::Running)?;
                }
                self.store().save_job(&job).await?;
            }
            TaskPhase::Completed => {
                job.transition_to(JobState::Completed)?;
                self.store().save_job(&job).await?;
                self.finalize_session(&job, EndReason::Graceful).await;
                info!(job = %job.id, "job completed");
            }
            TaskPhase::Failed => {
                job.last_error = update
                    .message
                    .clone()
                    .or_else(|| Some("provider reported failure".to_string()));
                // Execution failures are real outcomes, not scheduling
                // noise; the recovery sweep must not replay them.
                job.metadata
                    .insert(NO_RETRY_KEY.to_string(), NO_RETRY_VALUE.to_string());
                job.transition_to(JobState::Failed)?;
                self.store().save_job(&job).await?;
                self.finalize_session(&job, EndReason::Forced).await;
                info!(job = %job.id, error = ?job.last_error, "job failed on provider");
            }
            TaskPhase::Cancelled => {
                self.cancel_job(&job_id, "user_cancel").await?;
            }
        }

        Ok(())
    }

    /// User-initiated cancel: terminal job state, session settlement for
    /// whatever ran, and a cancellation directive to the provider.
    pub async fn cancel_job(&self, job_id: &JobId, reason: &str) -> Result<()> {
        let Some(mut job) = self.store().get_job(job_id).await? else {
            warn!(job = %job_id, "cancel for unknown job dropped");
            return Ok(());
        };
        if job.state.is_terminal() {
            return Ok(());
        }

        job.last_error = Some(reason.to_string());
        job.transition_to(JobState::Cancelled)?;
        self.store().save_job(&job).await?;

        self.finalize_session(&job, EndReason::UserCancel).await;

        if let Some(provider) = &job.assigned_provider {
            if let Some(session) = self.store().get_session_by_job(job_id).await? {
                let directive = CancelDirective {
                    job_id: job_id.to_string(),
                    session_id: session.id.to_string(),
                    reason: reason.to_string(),
                    requested_at: Utc::now(),
                };
                let payload = protocol::encode(&directive)?;
                // Best effort: a vanished provider cannot receive it anyway
                if let Err(e) = self
                    .bus()
                    .publish_dispatch(provider.as_str(), job_id.as_str(), payload)
                    .await
                {
                    debug!(job = %job_id, error = %e, "cancel directive undeliverable");
                }
            }
        }

        info!(job = %job_id, reason, "job cancelled");
        Ok(())
    }

    /// A billing-side termination (funds, ceiling) lands here; the job is
    /// failed and the provider is told to stop.
    pub(crate) async fn handle_billing_event(&self, event: BillingEvent) -> Result<()> {
        let BillingEvent::SessionEnded {
            session_id,
            job_id,
            reason,
        } = event;

        let Some(job_id) = job_id else {
            return Ok(());
        };
        let Some(mut job) = self.store().get_job(&job_id).await? else {
            return Ok(());
        };
        if job.state.is_terminal() {
            return Ok(());
        }

        job.last_error = Some(match reason {
            EndReason::FundsExhausted => "funds exhausted".to_string(),
            EndReason::CeilingReached => "cost ceiling reached".to_string(),
            other => other.to_string(),
        });
        job.metadata
            .insert(NO_RETRY_KEY.to_string(), NO_RETRY_VALUE.to_string());
        job.transition_to(JobState::Failed)?;
        self.store().save_job(&job).await?;

        if let Some(provider) = &job.assigned_provider {
            let directive = CancelDirective {
                job_id: job_id.to_string(),
                session_id: session_id.to_string(),
                reason: job.last_error.clone().unwrap_or_default(),
                requested_at: Utc::now(),
            };
            let payload = protocol::encode(&directive)?;
            if let Err(e) = self
                .bus()
                .publish_dispatch(provider.as_str(), job_id.as_str(), payload)
                .await
            {
                debug!(job = %job_id, error = %e, "termination directive undeliverable");
            }
        }

        info!(job = %job_id, %reason, "job terminated by billing");
        Ok(())
    }

    async fn finalize_session(&self, job: &crate::domain::Job, reason: EndReason) {
        match self.store().get_session_by_job(&job.id).await {
            Ok(Some(session)) => {
                if let Err(e) = self.billing().end_session(session.id, reason).await {
                    error!(
                        job = %job.id,
                        session = %session.id,
                        error = %e,
                        "session finalization failed; reconciliation sweep will retry"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => error!(job = %job.id, error = %e, "session lookup failed"),
        }
    }
}
