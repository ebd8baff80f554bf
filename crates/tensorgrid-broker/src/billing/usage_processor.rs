use crate::billing::session_manager::BillingEngine;
use crate::bus::pubsub::Subscription;
use crate::domain::{EndReason, SessionId, TokenAmount, UsageSample, WalletType};
use crate::domain::{LedgerTransaction, TransactionType};
use crate::error::{BrokerError, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tensorgrid_protocol::UsageReport;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const SAMPLE_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened to one ingested sample.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageOutcome {
    /// Folded into the session's accrual.
    Applied {
        period_cost: TokenAmount,
        accrued_total: TokenAmount,
    },
    /// Redelivered sample id; accrual unchanged.
    Duplicate,
    /// Not applied: inactive session or out-of-window timestamp.
    Dropped(&'static str),
    /// The sample was applied and tripped a termination guard.
    Terminated(EndReason),
}

impl BillingEngine {
    /// Fold one usage sample into its session.
    ///
    /// Samples for the same session are serialized; samples for different
    /// sessions run in parallel. Idempotent on the sample id.
    pub async fn process_usage(&self, report: &UsageReport) -> Result<UsageOutcome> {
        let session_id = SessionId::from_str(&report.session_id)
            .map_err(|e| BrokerError::validation("session_id", e.to_string()))?;

        let guard = self.locks.acquire(session_id).await;
        let result = self.process_usage_locked(session_id, report).await;
        drop(guard);
        self.locks.release_entry(&session_id).await;
        result
    }

    async fn process_usage_locked(
        &self,
        session_id: SessionId,
        report: &UsageReport,
    ) -> Result<UsageOutcome> {
        let mut session = match self.store().get_session(&session_id).await? {
            Some(session) => session,
            None => {
                warn!(session = %session_id, "usage sample for unknown session dropped");
                return Ok(UsageOutcome::Dropped("unknown session"));
            }
        };

        if session.status.is_terminal() {
            debug!(session = %session_id, "usage sample for terminal session dropped");
            return Ok(UsageOutcome::Dropped("session not active"));
        }

        if !session.accepts_sample_at(report.recorded_at) {
            warn!(
                session = %session_id,
                recorded_at = %report.recorded_at,
                "usage sample outside the session window rejected"
            );
            return Ok(UsageOutcome::Dropped("outside session window"));
        }

        let period_minutes = Decimal::from_f64(report.period_minutes).unwrap_or(Decimal::ZERO);
        if period_minutes <= Decimal::ZERO {
            return Ok(UsageOutcome::Dropped("non-positive period"));
        }

        let power_w = Decimal::from_f64(report.power_draw_w).unwrap_or(Decimal::ZERO);
        let period_hours = period_minutes / dec!(60);
        let period_cost = session
            .rates
            .period_cost(session.allocated_vram_mb, power_w, period_hours)
            .persisted();

        let sample = UsageSample::from_report(report, session_id, period_cost);
        if !self.store().append_usage(&sample).await? {
            debug!(session = %session_id, sample = %sample.id, "duplicate sample ignored");
            return Ok(UsageOutcome::Duplicate);
        }

        session.accrue(period_cost, power_w, report.recorded_at);
        self.store().update_session(&session).await?;
        self.store()
            .append_billing_record(&session_id, "accrual", period_cost, session.total_cost)
            .await?;

        // Termination guards run after accrual
        if session.total_cost.is_sufficient(session.max_cost_ceiling) {
            self.terminate(session_id, EndReason::CeilingReached).await?;
            return Ok(UsageOutcome::Terminated(EndReason::CeilingReached));
        }

        let wallet = self
            .store()
            .get_wallet_by_owner(session.user_id.as_str(), WalletType::User)
            .await?;
        let available = wallet
            .as_ref()
            .map(|w| w.available)
            .unwrap_or_else(TokenAmount::zero);

        let hourly = session
            .rates
            .period_cost(session.allocated_vram_mb, power_w, Decimal::ONE);
        let remaining_funds = session
            .locked_funds
            .add(available)
            .saturating_sub(session.total_cost);
        let remaining_seconds = if hourly.is_zero() {
            Decimal::MAX
        } else {
            remaining_funds.as_decimal() / hourly.as_decimal() * dec!(3600)
        };
        let grace_seconds = Decimal::from(self.config().insufficient_funds_grace_seconds);
        if remaining_seconds < grace_seconds {
            self.terminate(session_id, EndReason::FundsExhausted).await?;
            return Ok(UsageOutcome::Terminated(EndReason::FundsExhausted));
        }

        self.maybe_extend_reservation(&mut session).await?;

        Ok(UsageOutcome::Applied {
            period_cost,
            accrued_total: session.total_cost,
        })
    }

    async fn terminate(&self, session_id: SessionId, reason: EndReason) -> Result<()> {
        // The caller already holds this session's lock.
        self.end_session_locked(session_id, reason).await.map(|_| ())
    }

    /// When accrual approaches the reservation, lock another hour. If the
    /// wallet cannot cover it, skip: the funds guard fires on a later
    /// sample.
    async fn maybe_extend_reservation(
        &self,
        session: &mut crate::domain::RentalSession,
    ) -> Result<()> {
        let threshold = session
            .locked_funds
            .multiply(self.config().relock_threshold_percent / dec!(100));
        if !session.total_cost.is_sufficient(threshold) {
            return Ok(());
        }

        // Extension attempts are paced by the billing interval
        let cadence = Duration::from_secs(self.config().billing_interval_seconds);
        {
            let mut attempts = self.relock_attempts.lock().expect("relock attempt registry");
            if let Some(last) = attempts.get(&session.id) {
                if last.elapsed() < cadence {
                    return Ok(());
                }
            }
            attempts.insert(session.id, std::time::Instant::now());
        }

        let one_hour = session
            .rates
            .period_cost(
                session.allocated_vram_mb,
                Decimal::from(session.estimated_power_w),
                Decimal::ONE,
            )
            .persisted();

        let locked_this_call = std::sync::atomic::AtomicBool::new(false);
        let outcome = self
            .with_wallet_retry(session.user_id.as_str(), WalletType::User, |wallet| {
                if !wallet.available.is_sufficient(one_hour) {
                    // Leave the wallet untouched; nothing to extend with
                    locked_this_call.store(false, std::sync::atomic::Ordering::SeqCst);
                    return Ok(());
                }
                wallet.lock(one_hour)?;
                locked_this_call.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        match outcome {
            Ok(_) => {}
            Err(BrokerError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        if locked_this_call.load(std::sync::atomic::Ordering::SeqCst) {
            session.locked_funds = session.locked_funds.add(one_hour);
            self.store().update_session(session).await?;
            let billing_row = LedgerTransaction::new(
                TransactionType::SessionBilling,
                one_hour,
                format!("extended reservation for session {}", session.id),
            )
            .for_session(session.id)
            .confirmed();
            self.store().create_transaction(&billing_row).await?;
            self.store()
                .append_billing_record(&session.id, "re_lock", one_hour, session.total_cost)
                .await?;
            debug!(session = %session.id, amount = %one_hour, "reservation extended");
        } else {
            debug!(
                session = %session.id,
                "reservation extension skipped; available funds below one hour"
            );
        }

        Ok(())
    }

    /// Consume the usage stream until shutdown. The in-flight sample is
    /// allowed to finish before the task exits.
    pub fn spawn_usage_consumer(
        self: Arc<Self>,
        mut subscription: Subscription,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self;
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = subscription.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let report: UsageReport = match tensorgrid_protocol::decode(&message.payload) {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(subject = %message.subject, error = %e, "malformed usage sample dropped");
                        continue;
                    }
                };

                match tokio::time::timeout(SAMPLE_HANDLER_TIMEOUT, engine.process_usage(&report))
                    .await
                {
                    Ok(Ok(outcome)) => {
                        debug!(session = %report.session_id, ?outcome, "usage sample processed")
                    }
                    Ok(Err(e)) => {
                        error!(session = %report.session_id, error = %e, "usage sample failed")
                    }
                    Err(_) => {
                        error!(session = %report.session_id, "usage sample handler timed out")
                    }
                }
            }
            debug!("usage consumer stopped");
        })
    }
}
