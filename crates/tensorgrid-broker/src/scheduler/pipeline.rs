//! The per-submission consumption pipeline.

use crate::billing::StartSessionRequest;
use crate::bus::Delivery;
use crate::domain::{AvailabilityFilter, Job, JobId, JobState};
use crate::error::{BrokerError, Result};
use crate::scheduler::Scheduler;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tensorgrid_common::error::ErrorKind;
use tensorgrid_protocol::{self as protocol, JobSubmission, TaskDescriptor};
use tracing::{info, warn};

/// Marks a failed job as not worth re-queuing by the recovery sweep.
pub(crate) const NO_RETRY_KEY: &str = "retry";
pub(crate) const NO_RETRY_VALUE: &str = "false";

enum ScheduleOutcome {
    Dispatched,
    NoProviders,
}

impl Scheduler {
    /// Handle one delivered submission end to end, finishing with exactly
    /// one of ACK (done or poison) or NAK (try again later).
    pub(crate) async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let submission: JobSubmission = match protocol::decode(&delivery.payload) {
            Ok(submission) => submission,
            Err(e) => {
                // Poison pill: acking keeps it from looping forever
                warn!(error = %e, "malformed submission acked and dropped");
                return delivery.ack().await;
            }
        };

        let job_id = JobId::new(submission.job_id.clone());
        let existing = match self.store().get_job(&job_id).await {
            Ok(existing) => existing,
            Err(e) if e.is_transient() => {
                warn!(job = %job_id, error = %e, "store unavailable; submission nacked");
                return delivery.nak(self.config().store_error_delay()).await;
            }
            Err(e) => return Err(e),
        };

        if let Some(job) = &existing {
            if job.state.is_terminal() {
                return delivery.ack().await;
            }
            if job.state.is_dispatched() {
                // Redelivery raced an already-successful dispatch
                return delivery.ack().await;
            }
        }

        let mut job = existing.unwrap_or_else(|| Job::from_submission(submission));
        if let Err(e) = self.store().save_job(&job).await {
            warn!(job = %job.id, error = %e, "job persist failed; submission nacked");
            return delivery.nak(self.config().store_error_delay()).await;
        }

        match self.schedule(&mut job).await {
            Ok(ScheduleOutcome::Dispatched) => delivery.ack().await,
            Ok(ScheduleOutcome::NoProviders) => {
                job.record_failure("no suitable provider");

                if job.attempts >= self.config().scheduler.retry_ceiling {
                    job.last_error = Some("no_capacity".to_string());
                    job.metadata
                        .insert(NO_RETRY_KEY.to_string(), NO_RETRY_VALUE.to_string());
                    self.fail_job(&mut job).await?;
                    return delivery.ack().await;
                }

                if job.state == JobState::Searching {
                    job.transition_to(JobState::Pending)?;
                }
                self.store().save_job(&job).await?;
                delivery.nak(self.config().no_provider_delay()).await
            }
            Err(e) => {
                job.record_failure(e.to_string());
                match e.kind() {
                    ErrorKind::Validation
                    | ErrorKind::InsufficientFunds
                    | ErrorKind::PermanentInfra => {
                        job.metadata
                            .insert(NO_RETRY_KEY.to_string(), NO_RETRY_VALUE.to_string());
                        self.fail_job(&mut job).await?;
                        delivery.ack().await
                    }
                    _ => {
                        if job.state == JobState::Searching {
                            job.transition_to(JobState::Pending)?;
                        }
                        self.store().save_job(&job).await?;
                        delivery.nak(self.retry_delay_for(&e)).await
                    }
                }
            }
        }
    }

    /// Steps 4-9: match, reserve, dispatch, persist.
    async fn schedule(&self, job: &mut Job) -> Result<ScheduleOutcome> {
        if job.state == JobState::Pending {
            job.transition_to(JobState::Searching)?;
            self.store().save_job(job).await?;
        }

        let filter = AvailabilityFilter {
            gpu_model: job.requirements.gpu_model.clone(),
            min_vram_mb: (job.requirements.min_vram_mb > 0).then_some(job.requirements.min_vram_mb),
            min_gpu_count: Some(job.requirements.gpu_count.max(1)),
        };

        let candidates = self.directory().list_available(&filter).await?;
        let ranked = self.ranking().rank(candidates, job);
        let Some(provider) = ranked.into_iter().next() else {
            return Ok(ScheduleOutcome::NoProviders);
        };
        let Some(gpu) = provider.best_gpu(&filter).cloned() else {
            return Ok(ScheduleOutcome::NoProviders);
        };

        let allocated_vram_mb = if job.requirements.min_vram_mb > 0 {
            job.requirements.min_vram_mb
        } else {
            gpu.vram_mb
        };
        let estimated_power_w = if job.requirements.estimated_power_w > 0 {
            job.requirements.estimated_power_w
        } else {
            gpu.power_estimate_w
        };

        let overrides = self.store().get_provider_rates(&provider.id).await?;
        let receipt = self
            .billing()
            .start_session(StartSessionRequest {
                user_id: job.user_id.clone(),
                provider_id: provider.id.clone(),
                job_id: Some(job.id.clone()),
                gpu_model: gpu.model.clone(),
                allocated_vram_mb,
                total_vram_mb: gpu.vram_mb,
                estimated_power_w,
                cost_ceiling: job.cost_ceiling,
                provider_rates: (!overrides.is_empty()).then_some(overrides),
            })
            .await?;

        job.assign_provider(provider.id.clone());

        let duration_hours = Decimal::from(job.max_duration_minutes) / dec!(60);
        let descriptor = TaskDescriptor {
            job_id: job.id.to_string(),
            user_id: job.user_id.to_string(),
            session_id: receipt.session_id.to_string(),
            execution: job.execution.clone(),
            requirements: job.requirements.clone(),
            cost_ceiling: job.cost_ceiling.as_decimal(),
            estimated_cost: receipt.hourly_cost.multiply(duration_hours).as_decimal(),
            max_duration_minutes: job.max_duration_minutes,
            input_files: job.input_files.clone(),
            output_files: job.output_files.clone(),
            cleanup_workspace: true,
            dispatched_at: Utc::now(),
        };
        let payload = protocol::encode(&descriptor)?;

        if let Err(dispatch_err) = self
            .bus()
            .publish_dispatch(provider.id.as_str(), job.id.as_str(), payload)
            .await
        {
            warn!(
                job = %job.id,
                provider = %provider.id,
                error = %dispatch_err,
                "dispatch failed; unwinding reservation"
            );
            self.directory().mark_stale(&provider.id).await;
            if let Err(unwind_err) = self.billing().unwind_session(receipt.session_id).await {
                warn!(
                    session = %receipt.session_id,
                    error = %unwind_err,
                    "session unwind failed; reconciliation sweep will finish it"
                );
            }
            job.clear_assignment();
            return Err(dispatch_err);
        }

        job.attempts += 1;
        job.transition_to(JobState::Dispatched)?;
        self.store().save_job(job).await?;

        info!(
            job = %job.id,
            provider = %provider.id,
            session = %receipt.session_id,
            attempts = job.attempts,
            "job dispatched"
        );
        Ok(ScheduleOutcome::Dispatched)
    }

    pub(crate) async fn fail_job(&self, job: &mut Job) -> Result<()> {
        if !job.state.is_terminal() {
            job.transition_to(JobState::Failed)?;
        }
        self.store().save_job(job).await?;
        info!(job = %job.id, error = ?job.last_error, "job failed");
        Ok(())
    }

    fn retry_delay_for(&self, error: &BrokerError) -> chrono::Duration {
        match error {
            BrokerError::Registry { .. } | BrokerError::Bus { .. } => {
                self.config().registry_error_delay()
            }
            _ => self.config().store_error_delay(),
        }
    }
}
