use crate::domain::types::{JobId, SessionId, TokenAmount, WalletId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// What kind of accounting event a ledger row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    SessionStart,
    SessionEnd,
    SessionBilling,
    PlatformFee,
    Payout,
    Refund,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::SessionStart => "session_start",
            TransactionType::SessionEnd => "session_end",
            TransactionType::SessionBilling => "session_billing",
            TransactionType::PlatformFee => "platform_fee",
            TransactionType::Payout => "payout",
            TransactionType::Refund => "refund",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "session_start" => Ok(TransactionType::SessionStart),
            "session_end" => Ok(TransactionType::SessionEnd),
            "session_billing" => Ok(TransactionType::SessionBilling),
            "platform_fee" => Ok(TransactionType::PlatformFee),
            "payout" => Ok(TransactionType::Payout),
            "refund" => Ok(TransactionType::Refund),
            other => Err(format!("unknown transaction type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "failed" => Ok(TransactionStatus::Failed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            other => Err(format!("unknown transaction status '{other}'")),
        }
    }
}

/// One accounting event. Append-only; status is the only mutable field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub from_wallet: Option<WalletId>,
    pub to_wallet: Option<WalletId>,
    pub amount: TokenAmount,
    pub fee: TokenAmount,
    pub description: String,
    /// Opaque signature returned by the external settlement service.
    pub external_signature: Option<String>,
    pub session_id: Option<SessionId>,
    pub job_id: Option<JobId>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn new(
        transaction_type: TransactionType,
        amount: TokenAmount,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            transaction_type,
            status: TransactionStatus::Pending,
            from_wallet: None,
            to_wallet: None,
            amount,
            fee: TokenAmount::zero(),
            description: description.into(),
            external_signature: None,
            session_id: None,
            job_id: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_wallet(mut self, wallet: WalletId) -> Self {
        self.from_wallet = Some(wallet);
        self
    }

    pub fn to_wallet(mut self, wallet: WalletId) -> Self {
        self.to_wallet = Some(wallet);
        self
    }

    pub fn for_session(mut self, session: SessionId) -> Self {
        self.session_id = Some(session);
        self
    }

    pub fn for_job(mut self, job: JobId) -> Self {
        self.job_id = Some(job);
        self
    }

    pub fn with_fee(mut self, fee: TokenAmount) -> Self {
        self.fee = fee;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.status = TransactionStatus::Confirmed;
        self
    }
}
