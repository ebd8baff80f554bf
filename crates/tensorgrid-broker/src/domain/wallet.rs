use crate::domain::types::{TokenAmount, WalletId};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which party a wallet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletType {
    User,
    Provider,
    Platform,
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WalletType::User => "user",
            WalletType::Provider => "provider",
            WalletType::Platform => "platform",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WalletType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(WalletType::User),
            "provider" => Ok(WalletType::Provider),
            "platform" => Ok(WalletType::Platform),
            other => Err(format!("unknown wallet type '{other}'")),
        }
    }
}

/// Ledger of a single party. Balances live only in the Store; this
/// aggregate is read under a transaction and written back with an
/// optimistic version check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub owner_id: String,
    pub wallet_type: WalletType,
    /// Opaque address at the external settlement service.
    pub settlement_address: String,
    pub available: TokenAmount,
    pub locked: TokenAmount,
    pub pending: TokenAmount,
    pub active: bool,
    /// Bumped on every balance write; stale writes are conflicts.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(owner_id: impl Into<String>, wallet_type: WalletType, settlement_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WalletId::new(),
            owner_id: owner_id.into(),
            wallet_type,
            settlement_address: settlement_address.into(),
            available: TokenAmount::zero(),
            locked: TokenAmount::zero(),
            pending: TokenAmount::zero(),
            active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move `amount` from available to locked.
    pub fn lock(&mut self, amount: TokenAmount) -> Result<()> {
        let available = self.available.checked_sub(amount).ok_or_else(|| {
            BrokerError::InsufficientFunds {
                available: self.available.as_decimal(),
                required: amount.as_decimal(),
            }
        })?;
        self.available = available;
        self.locked = self.locked.add(amount);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Return `amount` from locked to available. Clamped to what is locked.
    pub fn unlock(&mut self, amount: TokenAmount) {
        let released = amount.min(self.locked);
        self.locked = self.locked.saturating_sub(released);
        self.available = self.available.add(released);
        self.updated_at = Utc::now();
    }

    pub fn unlock_all(&mut self) -> TokenAmount {
        let released = self.locked;
        self.unlock(released);
        released
    }

    pub fn debit(&mut self, amount: TokenAmount) -> Result<()> {
        let available = self.available.checked_sub(amount).ok_or_else(|| {
            BrokerError::InsufficientFunds {
                available: self.available.as_decimal(),
                required: amount.as_decimal(),
            }
        })?;
        self.available = available;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn credit(&mut self, amount: TokenAmount) {
        self.available = self.available.add(amount);
        self.updated_at = Utc::now();
    }

    /// The non-negativity invariant every write must satisfy.
    pub fn balances_valid(&self) -> bool {
        !self.available.is_negative() && !self.locked.is_negative() && !self.pending.is_negative()
    }
}
