use crate::billing::{
    BillingEvent, BillingEventSender, SessionLocks, SessionReceipt, SettlementRequest,
    SettlementService, StartSessionRequest,
};
use crate::config::BillingConfig;
use crate::domain::{
    EndReason, LedgerTransaction, RentalSession, SessionId, SessionStatus, TokenAmount,
    TransactionStatus, TransactionType, Wallet, WalletType,
};
use crate::error::{BrokerError, Result};
use crate::pricing::{PriceRequest, PricingEngine};
use crate::storage::Store;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WALLET_RETRY_CAP: u32 = 5;

/// Final accounting for a settled session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettlement {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub reason: Option<EndReason>,
    pub total_cost: TokenAmount,
    pub settled_amount: TokenAmount,
    pub platform_fee: TokenAmount,
    pub provider_earnings: TokenAmount,
}

/// Owns the session aggregate and the wallet-reservation protocol.
pub struct BillingEngine {
    store: Arc<Store>,
    pricing: Arc<PricingEngine>,
    settlement: Arc<dyn SettlementService>,
    config: BillingConfig,
    events: BillingEventSender,
    pub(crate) locks: SessionLocks,
    /// Last reservation-extension attempt per session; enforces the
    /// re-lock cadence. A cache only, rebuilt empty on restart.
    pub(crate) relock_attempts: std::sync::Mutex<std::collections::HashMap<SessionId, std::time::Instant>>,
}

impl BillingEngine {
    pub fn new(
        store: Arc<Store>,
        pricing: Arc<PricingEngine>,
        settlement: Arc<dyn SettlementService>,
        config: BillingConfig,
        events: BillingEventSender,
    ) -> Self {
        Self {
            store,
            pricing,
            settlement,
            config,
            events,
            locks: SessionLocks::default(),
            relock_attempts: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Open a session: reserve one hour of funds, freeze rates, persist
    /// the Active session. The reservation, the ledger row, and the
    /// session row commit in one transaction.
    pub async fn start_session(&self, request: StartSessionRequest) -> Result<SessionReceipt> {
        let quote = self.pricing.quote(&PriceRequest {
            gpu_model: request.gpu_model.clone(),
            requested_vram_mb: request.allocated_vram_mb,
            total_vram_mb: request.total_vram_mb,
            estimated_power_w: request.estimated_power_w,
            duration_hours: Decimal::ONE,
            provider_rates: request.provider_rates.clone(),
            user_discount_percent: None,
        })?;
        let one_hour_cost = quote.total_cost;

        if one_hour_cost.as_decimal() > self.config.max_transaction_amount {
            return Err(BrokerError::validation(
                "hourly_cost",
                format!(
                    "{} exceeds the maximum transaction amount {}",
                    one_hour_cost, self.config.max_transaction_amount
                ),
            ));
        }

        let mut attempt = 0;
        loop {
            let wallet = self
                .store
                .get_wallet_by_owner(request.user_id.as_str(), WalletType::User)
                .await?
                .ok_or_else(|| BrokerError::InsufficientFunds {
                    available: Decimal::ZERO,
                    required: one_hour_cost.as_decimal(),
                })?;

            let available_before = wallet.available;
            if available_before.as_decimal() < self.config.minimum_balance {
                return Err(BrokerError::InsufficientFunds {
                    available: available_before.as_decimal(),
                    required: self.config.minimum_balance,
                });
            }
            if !available_before.is_sufficient(one_hour_cost) {
                return Err(BrokerError::InsufficientFunds {
                    available: available_before.as_decimal(),
                    required: one_hour_cost.as_decimal(),
                });
            }

            let mut reserved = wallet.clone();
            reserved.lock(one_hour_cost)?;

            let now = Utc::now();
            let session = RentalSession {
                id: SessionId::new(),
                user_id: request.user_id.clone(),
                provider_id: request.provider_id.clone(),
                job_id: request.job_id.clone(),
                status: SessionStatus::Active,
                gpu_model: request.gpu_model.clone(),
                allocated_vram_mb: request.allocated_vram_mb,
                total_vram_mb: request.total_vram_mb,
                vram_percentage: quote.vram_percentage,
                estimated_power_w: request.estimated_power_w,
                actual_power_w: None,
                rates: quote.rate_card,
                total_cost: TokenAmount::zero(),
                platform_fee: TokenAmount::zero(),
                provider_earnings: TokenAmount::zero(),
                max_cost_ceiling: request.cost_ceiling,
                locked_funds: one_hour_cost,
                started_at: now,
                last_billed_at: now,
                ended_at: None,
                updated_at: now,
                end_reason: None,
            };

            let ledger = LedgerTransaction::new(
                TransactionType::SessionStart,
                one_hour_cost,
                format!("reserve one hour for session {}", session.id),
            )
            .from_wallet(wallet.id)
            .for_session(session.id)
            .confirmed();
            let ledger = match &request.job_id {
                Some(job) => ledger.for_job(job.clone()),
                None => ledger,
            };

            let mut tx = self.store.begin().await?;
            match self.store.update_wallet_balances_tx(&mut tx, &reserved).await {
                Ok(_) => {}
                Err(BrokerError::Conflict { .. }) if attempt < WALLET_RETRY_CAP => {
                    drop(tx);
                    attempt += 1;
                    self.conflict_backoff(attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.store.create_transaction_tx(&mut tx, &ledger).await?;
            self.store.create_session_tx(&mut tx, &session).await?;
            tx.commit()
                .await
                .map_err(|e| BrokerError::database("start_session", e))?;

            info!(
                session = %session.id,
                user = %request.user_id,
                provider = %request.provider_id,
                hourly = %one_hour_cost,
                "session opened"
            );

            let remaining_available = available_before.saturating_sub(one_hour_cost);
            if remaining_available.as_decimal() < self.config.low_balance_threshold {
                warn!(
                    user = %request.user_id,
                    available = %remaining_available,
                    "balance below the low-balance threshold after reservation"
                );
            }
            return Ok(SessionReceipt {
                session_id: session.id,
                current_cost: TokenAmount::zero(),
                hourly_cost: one_hour_cost,
                remaining_available,
                estimated_runtime_hours: available_before.as_decimal()
                    / one_hour_cost.as_decimal(),
            });
        }
    }

    /// Close a session and settle funds. Idempotent: a second call returns
    /// the existing terminal accounting without moving money again.
    pub async fn end_session(
        &self,
        session_id: SessionId,
        reason: EndReason,
    ) -> Result<SessionSettlement> {
        let guard = self.locks.acquire(session_id).await;
        let result = self.end_session_locked(session_id, reason).await;
        drop(guard);
        self.locks.release_entry(&session_id).await;
        result
    }

    pub(crate) async fn end_session_locked(
        &self,
        session_id: SessionId,
        reason: EndReason,
    ) -> Result<SessionSettlement> {
        let mut session = self
            .store
            .get_session(&session_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            })?;

        if session.status.is_terminal() {
            return Ok(settlement_view(&session));
        }

        // The persisted samples are the accounting truth; reconcile the
        // running total against them in this single update.
        let accrued = self.store.sum_usage_costs(&session_id).await?;

        let provider_wallet = self
            .ensure_wallet(session.provider_id.as_str(), WalletType::Provider)
            .await?;
        let platform_wallet = self.ensure_wallet("platform", WalletType::Platform).await?;

        let mut attempt = 0;
        let (settled, platform_fee, provider_earnings) = loop {
            let user_wallet = self
                .store
                .get_wallet_by_owner(session.user_id.as_str(), WalletType::User)
                .await?
                .ok_or_else(|| BrokerError::NotFound {
                    entity: "wallet",
                    id: session.user_id.to_string(),
                })?;
            let mut provider_wallet = self
                .store
                .get_wallet(&provider_wallet.id)
                .await?
                .ok_or_else(|| BrokerError::NotFound {
                    entity: "wallet",
                    id: provider_wallet.id.to_string(),
                })?;
            let mut platform_wallet = self
                .store
                .get_wallet(&platform_wallet.id)
                .await?
                .ok_or_else(|| BrokerError::NotFound {
                    entity: "wallet",
                    id: platform_wallet.id.to_string(),
                })?;

            let mut settled_user = user_wallet.clone();
            let unlockable = session.locked_funds.min(settled_user.locked);
            settled_user.unlock(unlockable);

            // A session may outrun the user's funds by part of one sample;
            // the debit is capped at what the wallet holds.
            let settled = accrued.min(settled_user.available).persisted();
            settled_user.debit(settled)?;

            let platform_fee = session.rates.platform_fee(settled).persisted();
            let provider_earnings = settled.saturating_sub(platform_fee);
            provider_wallet.credit(provider_earnings);
            platform_wallet.credit(platform_fee);

            let settle_call = self.settlement.settle(SettlementRequest {
                wallet_address: settled_user.settlement_address.clone(),
                amount: settled,
                idempotency_key: session.id.to_string(),
            });
            let signature = tokio::time::timeout(
                Duration::from_secs(self.config.settlement_timeout_seconds),
                settle_call,
            )
            .await
            .map_err(|_| BrokerError::Settlement {
                message: format!("settlement timed out for session {}", session.id),
            })??;

            let mut tx = self.store.begin().await?;
            match write_wallets(
                &self.store,
                &mut tx,
                [&settled_user, &provider_wallet, &platform_wallet],
            )
            .await
            {
                Ok(_) => {}
                Err(BrokerError::Conflict { .. }) if attempt < WALLET_RETRY_CAP => {
                    drop(tx);
                    attempt += 1;
                    self.conflict_backoff(attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut session_end = LedgerTransaction::new(
                TransactionType::SessionEnd,
                settled,
                format!("settle session {} ({reason})", session.id),
            )
            .from_wallet(user_wallet.id)
            .for_session(session.id)
            .confirmed();
            session_end.external_signature = Some(signature);
            self.store.create_transaction_tx(&mut tx, &session_end).await?;

            let fee_row = LedgerTransaction::new(
                TransactionType::PlatformFee,
                platform_fee,
                format!("platform fee for session {}", session.id),
            )
            .from_wallet(user_wallet.id)
            .to_wallet(platform_wallet.id)
            .for_session(session.id)
            .confirmed();
            self.store.create_transaction_tx(&mut tx, &fee_row).await?;

            // Provider payout is deferred: recorded pending, finalized by
            // the external settlement integration.
            if provider_earnings.as_decimal() >= self.config.minimum_payout_amount
                && !provider_earnings.is_zero()
            {
                let payout_fee = provider_earnings
                    .multiply(self.config.payout_fee_percent / dec!(100))
                    .persisted();
                let payout = LedgerTransaction::new(
                    TransactionType::Payout,
                    provider_earnings,
                    format!("provider payout for session {}", session.id),
                )
                .to_wallet(provider_wallet.id)
                .for_session(session.id)
                .with_fee(payout_fee);
                self.store.create_transaction_tx(&mut tx, &payout).await?;
            }

            session.total_cost = accrued;
            session.platform_fee = platform_fee;
            session.provider_earnings = provider_earnings;
            session.locked_funds = TokenAmount::zero();
            session.end_reason = Some(reason);
            session.transition_to(reason.terminal_status())?;
            self.store.update_session_tx(&mut tx, &session).await?;

            tx.commit()
                .await
                .map_err(|e| BrokerError::database("end_session", e))?;

            break (settled, platform_fee, provider_earnings);
        };

        self.store
            .append_billing_record(&session.id, "settlement", settled, accrued)
            .await?;
        self.relock_attempts
            .lock()
            .expect("relock attempt registry")
            .remove(&session.id);

        info!(
            session = %session.id,
            %reason,
            %settled,
            fee = %platform_fee,
            earnings = %provider_earnings,
            "session settled"
        );

        if matches!(reason, EndReason::FundsExhausted | EndReason::CeilingReached) {
            let _ = self
                .events
                .send(BillingEvent::SessionEnded {
                    session_id: session.id,
                    job_id: session.job_id.clone(),
                    reason,
                })
                .await;
        }

        Ok(SessionSettlement {
            session_id: session.id,
            status: session.status,
            reason: Some(reason),
            total_cost: accrued,
            settled_amount: settled,
            platform_fee,
            provider_earnings,
        })
    }

    /// Dispatch-failure path: release the reservation without charging.
    /// The session never ran; nothing accrued.
    pub async fn unwind_session(&self, session_id: SessionId) -> Result<()> {
        let guard = self.locks.acquire(session_id).await;
        let result = self.unwind_session_locked(session_id).await;
        drop(guard);
        self.locks.release_entry(&session_id).await;
        result
    }

    async fn unwind_session_locked(&self, session_id: SessionId) -> Result<()> {
        let mut session = self
            .store
            .get_session(&session_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            })?;

        if session.status.is_terminal() {
            return Ok(());
        }

        let released = session.locked_funds;
        self.with_wallet_retry(session.user_id.as_str(), WalletType::User, |wallet| {
            wallet.unlock(released);
            Ok(())
        })
        .await?;

        let refund = LedgerTransaction::new(
            TransactionType::Refund,
            released,
            format!("dispatch failed; reservation released for session {session_id}"),
        )
        .for_session(session_id)
        .confirmed();
        self.store.create_transaction(&refund).await?;

        session.locked_funds = TokenAmount::zero();
        session.end_reason = Some(EndReason::Forced);
        session.transition_to(SessionStatus::Cancelled)?;
        self.store.update_session(&session).await?;

        debug!(session = %session_id, amount = %released, "session unwound");
        Ok(())
    }

    /// Startup sweep over non-terminal sessions.
    ///
    /// Two stuck shapes are repaired idempotently: a crash between the
    /// settlement transaction and the session update (confirmed SessionEnd
    /// with the session still open), and an orphaned reservation whose job
    /// never kept the dispatch (or already finished through another path).
    pub async fn reconcile_sessions(&self) -> Result<usize> {
        let open = self.store.get_active_sessions().await?;
        let mut reconciled = 0;

        for mut session in open {
            let ledger = self.store.get_transactions_by_session(&session.id).await?;
            let settled = ledger.iter().any(|t| {
                t.transaction_type == TransactionType::SessionEnd
                    && t.status == TransactionStatus::Confirmed
            });
            if !settled {
                if let Some(job_id) = &session.job_id {
                    if let Some(job) = self.store.get_job(job_id).await? {
                        let orphaned = job.state.is_terminal()
                            || job.assigned_provider.as_ref() != Some(&session.provider_id);
                        if orphaned {
                            warn!(session = %session.id, job = %job_id, "orphaned reservation; settling");
                            self.end_session(session.id, EndReason::Forced).await?;
                            reconciled += 1;
                        }
                    }
                }
                continue;
            }

            warn!(session = %session.id, "session stuck mid-settle; finishing");
            let accrued = self.store.sum_usage_costs(&session.id).await?;
            session.total_cost = accrued;
            session.platform_fee = session.rates.platform_fee(accrued).persisted();
            session.provider_earnings = session.total_cost.saturating_sub(session.platform_fee);
            session.locked_funds = TokenAmount::zero();
            session.end_reason = Some(EndReason::Forced);
            session.transition_to(SessionStatus::Terminated)?;
            self.store.update_session(&session).await?;

            let _ = self
                .events
                .send(BillingEvent::SessionEnded {
                    session_id: session.id,
                    job_id: session.job_id.clone(),
                    reason: EndReason::Forced,
                })
                .await;
            reconciled += 1;
        }

        Ok(reconciled)
    }

    /// Read-modify-write a wallet under the optimistic version check,
    /// retrying conflicts with jittered backoff.
    pub(crate) async fn with_wallet_retry<F>(
        &self,
        owner: &str,
        wallet_type: WalletType,
        mutate: F,
    ) -> Result<Wallet>
    where
        F: Fn(&mut Wallet) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            let mut wallet = self
                .store
                .get_wallet_by_owner(owner, wallet_type)
                .await?
                .ok_or_else(|| BrokerError::NotFound {
                    entity: "wallet",
                    id: owner.to_string(),
                })?;

            mutate(&mut wallet)?;

            match self.store.update_wallet_balances(&wallet).await {
                Ok(updated) => return Ok(updated),
                Err(BrokerError::Conflict { .. }) if attempt < WALLET_RETRY_CAP => {
                    attempt += 1;
                    self.conflict_backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch a wallet, creating it on first use (provider and platform
    /// wallets appear lazily at settlement).
    pub(crate) async fn ensure_wallet(
        &self,
        owner: &str,
        wallet_type: WalletType,
    ) -> Result<Wallet> {
        if let Some(wallet) = self.store.get_wallet_by_owner(owner, wallet_type).await? {
            return Ok(wallet);
        }

        let wallet = Wallet::new(owner, wallet_type, format!("{wallet_type}:{owner}"));
        match self.store.create_wallet(&wallet).await {
            Ok(()) => Ok(wallet),
            // Lost a creation race; the winner's row is authoritative
            Err(BrokerError::Conflict { .. }) => self
                .store
                .get_wallet_by_owner(owner, wallet_type)
                .await?
                .ok_or_else(|| BrokerError::NotFound {
                    entity: "wallet",
                    id: owner.to_string(),
                }),
            Err(e) => Err(e),
        }
    }

    async fn conflict_backoff(&self, attempt: u32) {
        let jitter_ms: u64 = rand::thread_rng().gen_range(5..25);
        let backoff = Duration::from_millis(2u64.pow(attempt.min(6)) * 10 + jitter_ms);
        tokio::time::sleep(backoff).await;
    }
}

async fn write_wallets(
    store: &Store,
    tx: &mut crate::storage::StoreTx<'_>,
    wallets: [&Wallet; 3],
) -> Result<()> {
    for wallet in wallets {
        store.update_wallet_balances_tx(tx, wallet).await?;
    }
    Ok(())
}

fn settlement_view(session: &RentalSession) -> SessionSettlement {
    SessionSettlement {
        session_id: session.id,
        status: session.status,
        reason: session.end_reason,
        total_cost: session.total_cost,
        settled_amount: session.platform_fee.add(session.provider_earnings),
        platform_fee: session.platform_fee,
        provider_earnings: session.provider_earnings,
    }
}
