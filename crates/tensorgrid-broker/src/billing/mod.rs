//! Per-session metering: reserve funds, ingest usage, accrue cost,
//! enforce limits, settle.
//!
//! The scheduler and the billing engine talk through explicit contracts:
//! [`StartSessionRequest`]/[`SessionReceipt`] on the way in, and
//! [`BillingEvent`] notifications on the way out. Neither instantiates the
//! other.

pub mod session_manager;
pub mod settlement;
pub mod usage_processor;

use crate::domain::{EndReason, JobId, ProviderId, SessionId, TokenAmount, UserId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

pub use session_manager::{BillingEngine, SessionSettlement};
pub use settlement::{LocalSettlement, SettlementRequest, SettlementService};
pub use usage_processor::UsageOutcome;

/// Scheduler -> BillingEngine: open a session against a chosen provider.
#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub job_id: Option<JobId>,
    pub gpu_model: String,
    pub allocated_vram_mb: u64,
    pub total_vram_mb: u64,
    pub estimated_power_w: u32,
    pub cost_ceiling: TokenAmount,
    /// Per-provider base-rate overrides, if the provider carries any.
    pub provider_rates: Option<HashMap<String, Decimal>>,
}

/// BillingEngine -> Scheduler: the opened session.
#[derive(Debug, Clone)]
pub struct SessionReceipt {
    pub session_id: SessionId,
    pub current_cost: TokenAmount,
    pub hourly_cost: TokenAmount,
    pub remaining_available: TokenAmount,
    pub estimated_runtime_hours: Decimal,
}

/// Notifications the billing engine pushes to the scheduler.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    /// A session reached a terminal state outside the scheduler's own
    /// end-session calls: funds ran out, the ceiling was hit, or an
    /// external cancellation landed.
    SessionEnded {
        session_id: SessionId,
        job_id: Option<JobId>,
        reason: EndReason,
    },
}

pub type BillingEventSender = mpsc::Sender<BillingEvent>;
pub type BillingEventReceiver = mpsc::Receiver<BillingEvent>;

pub fn billing_event_channel(capacity: usize) -> (BillingEventSender, BillingEventReceiver) {
    mpsc::channel(capacity)
}

/// Per-key async mutexes: usage samples for the same session are
/// serialized, sessions proceed in parallel.
#[derive(Clone, Default)]
pub(crate) struct SessionLocks {
    inner: Arc<Mutex<HashMap<SessionId, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub(crate) async fn acquire(&self, id: SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }

    pub(crate) async fn release_entry(&self, id: &SessionId) {
        let mut map = self.inner.lock().await;
        if let Some(lock) = map.get(id) {
            // Drop the registry entry once nothing else holds the lock.
            if Arc::strong_count(lock) == 1 {
                map.remove(id);
            }
        }
    }
}
