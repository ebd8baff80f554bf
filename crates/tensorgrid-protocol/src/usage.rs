//! Usage samples streamed from the executing provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One observation of GPU/power/utilization over a bounded window.
///
/// `sample_id` is minted by the producer; consumers deduplicate on it under
/// at-least-once delivery. `period_minutes` is carried per sample, so
/// variable reporting intervals are admissible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub sample_id: Uuid,
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub gpu_utilization_percent: f64,
    pub vram_utilization_percent: f64,
    pub power_draw_w: f64,
    pub temperature_c: f64,
    pub period_minutes: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_usage_round_trip() {
        let report = UsageReport {
            sample_id: Uuid::new_v4(),
            session_id: "sess-3".to_string(),
            recorded_at: Utc::now(),
            gpu_utilization_percent: 97.5,
            vram_utilization_percent: 88.0,
            power_draw_w: 450.0,
            temperature_c: 71.0,
            period_minutes: 1.0,
        };
        let bytes = crate::encode(&report).unwrap();
        let decoded: UsageReport = crate::decode(&bytes).unwrap();
        assert_eq!(report, decoded);
    }
}
