use crate::domain::types::{SessionId, TokenAmount};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tensorgrid_protocol::UsageReport;
use uuid::Uuid;

/// One persisted observation from the executing provider, with the period
/// cost computed at ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub id: Uuid,
    pub session_id: SessionId,
    pub recorded_at: DateTime<Utc>,
    pub gpu_utilization_percent: Decimal,
    pub vram_utilization_percent: Decimal,
    pub power_draw_w: Decimal,
    pub temperature_c: Decimal,
    pub period_minutes: Decimal,
    pub period_cost: TokenAmount,
}

impl UsageSample {
    /// Build from a wire report; the period cost is attached by the
    /// billing engine after rate computation.
    pub fn from_report(report: &UsageReport, session_id: SessionId, period_cost: TokenAmount) -> Self {
        let dec = |v: f64| Decimal::from_f64(v).unwrap_or(Decimal::ZERO);
        Self {
            id: report.sample_id,
            session_id,
            recorded_at: report.recorded_at,
            gpu_utilization_percent: dec(report.gpu_utilization_percent),
            vram_utilization_percent: dec(report.vram_utilization_percent),
            power_draw_w: dec(report.power_draw_w),
            temperature_c: dec(report.temperature_c),
            period_minutes: dec(report.period_minutes),
            period_cost,
        }
    }

    pub fn period_hours(&self) -> Decimal {
        self.period_minutes / Decimal::from(60)
    }
}
