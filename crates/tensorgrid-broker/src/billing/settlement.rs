//! External settlement boundary.
//!
//! The core records ledger movements against an opaque settlement service;
//! signatures returned by it are stored verbatim and never interpreted.

use crate::domain::TokenAmount;
use crate::error::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub wallet_address: String,
    pub amount: TokenAmount,
    /// Replays with the same key must be safe on the service side.
    pub idempotency_key: String,
}

#[async_trait]
pub trait SettlementService: Send + Sync {
    /// Submit a settlement and return the service's opaque signature.
    async fn settle(&self, request: SettlementRequest) -> Result<String>;
}

/// Deterministic in-process settlement for tests and single-node runs:
/// echoes a signature derived from the request, so replays produce the
/// same signature.
#[derive(Default)]
pub struct LocalSettlement;

#[async_trait]
impl SettlementService for LocalSettlement {
    async fn settle(&self, request: SettlementRequest) -> Result<String> {
        Ok(format!(
            "local:{}:{}:{}",
            request.wallet_address,
            request.idempotency_key,
            request.amount.persisted()
        ))
    }
}
