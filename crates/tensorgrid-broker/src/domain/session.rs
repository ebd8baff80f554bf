use crate::domain::types::{JobId, ProviderId, SessionId, TokenAmount, UserId};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a rental session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Suspended,
    Completed,
    Cancelled,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Terminated
        )
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Suspended)
                | (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Active, SessionStatus::Cancelled)
                | (SessionStatus::Active, SessionStatus::Terminated)
                | (SessionStatus::Suspended, SessionStatus::Active)
                | (SessionStatus::Suspended, SessionStatus::Cancelled)
                | (SessionStatus::Suspended, SessionStatus::Terminated)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "suspended" => Ok(SessionStatus::Suspended),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "terminated" => Ok(SessionStatus::Terminated),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Why a session ended. Determines the terminal status and the settlement
/// ledger annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Graceful,
    UserCancel,
    FundsExhausted,
    CeilingReached,
    Forced,
}

impl EndReason {
    pub fn terminal_status(&self) -> SessionStatus {
        match self {
            EndReason::Graceful => SessionStatus::Completed,
            EndReason::UserCancel => SessionStatus::Cancelled,
            EndReason::FundsExhausted | EndReason::CeilingReached | EndReason::Forced => {
                SessionStatus::Terminated
            }
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Graceful => "graceful",
            EndReason::UserCancel => "user_cancel",
            EndReason::FundsExhausted => "funds",
            EndReason::CeilingReached => "ceiling",
            EndReason::Forced => "force",
        };
        write!(f, "{s}")
    }
}

/// Rates frozen when a session becomes Active. Immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateCard {
    /// Base hourly rate for the GPU model.
    pub base_hourly: Decimal,
    /// Rate per GB of allocated VRAM per hour.
    pub vram_per_gb_hour: Decimal,
    /// Rate per kW of drawn power per hour.
    pub power_per_kw_hour: Decimal,
    /// Platform fee as a percentage of total cost.
    pub platform_fee_percent: Decimal,
}

impl RateCard {
    /// Cost of one period at the given observed power draw.
    ///
    /// `allocated_vram_mb` and `power_w` are folded exactly as quoted:
    /// base + vram·GB + power·kW, scaled by the period length in hours.
    pub fn period_cost(&self, allocated_vram_mb: u64, power_w: Decimal, period_hours: Decimal) -> TokenAmount {
        let vram_gb = Decimal::from(allocated_vram_mb) / dec!(1024);
        let power_kw = power_w / dec!(1000);
        let hourly = self.base_hourly + self.vram_per_gb_hour * vram_gb + self.power_per_kw_hour * power_kw;
        TokenAmount::from_decimal(hourly * period_hours)
    }

    pub fn platform_fee(&self, total: TokenAmount) -> TokenAmount {
        total.multiply(self.platform_fee_percent / dec!(100))
    }
}

/// The atom of metered billing, 1:1 with a dispatched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RentalSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub job_id: Option<JobId>,
    pub status: SessionStatus,

    // Allocation
    pub gpu_model: String,
    pub allocated_vram_mb: u64,
    pub total_vram_mb: u64,
    pub vram_percentage: Decimal,
    pub estimated_power_w: u32,
    pub actual_power_w: Option<Decimal>,

    // Rates, frozen at start
    pub rates: RateCard,

    // Accounting
    pub total_cost: TokenAmount,
    pub platform_fee: TokenAmount,
    pub provider_earnings: TokenAmount,
    /// Ceiling carried over from the job; accrual past this terminates.
    pub max_cost_ceiling: TokenAmount,
    /// Funds currently locked on the user wallet for this session.
    pub locked_funds: TokenAmount,

    pub started_at: DateTime<Utc>,
    pub last_billed_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub end_reason: Option<EndReason>,
}

impl RentalSession {
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BrokerError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        let now = Utc::now();
        self.updated_at = now;
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    /// Fold one period cost into the running totals.
    pub fn accrue(&mut self, period_cost: TokenAmount, observed_power_w: Decimal, billed_at: DateTime<Utc>) {
        self.total_cost = self.total_cost.add(period_cost);
        self.platform_fee = self.rates.platform_fee(self.total_cost);
        self.provider_earnings = self.total_cost.saturating_sub(self.platform_fee);
        self.actual_power_w = Some(observed_power_w);
        if billed_at > self.last_billed_at {
            self.last_billed_at = billed_at;
        }
        self.updated_at = Utc::now();
    }

    /// Whether an incoming sample timestamp falls inside the session window.
    pub fn accepts_sample_at(&self, recorded_at: DateTime<Utc>) -> bool {
        if recorded_at < self.started_at {
            return false;
        }
        match self.ended_at {
            Some(ended) => recorded_at <= ended,
            None => true,
        }
    }
}
