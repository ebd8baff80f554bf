use crate::domain::types::ProviderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tensorgrid_common::LocationTag;

/// Registry-reported status of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Idle,
    Busy,
    Offline,
    Maintenance,
    Error,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderStatus::Idle => "idle",
            ProviderStatus::Busy => "busy",
            ProviderStatus::Offline => "offline",
            ProviderStatus::Maintenance => "maintenance",
            ProviderStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One GPU on a provider host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub model: String,
    pub vram_mb: u64,
    pub healthy: bool,
    /// Power draw estimate in watts, reported by the host.
    pub power_estimate_w: u32,
}

/// External projection of a registered provider; the core holds no
/// ownership over this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub display_name: String,
    pub location: LocationTag,
    pub status: ProviderStatus,
    pub gpus: Vec<GpuDevice>,
    /// Active session count reported by the registry; used for ranking.
    pub current_load: u32,
    pub last_seen_at: DateTime<Utc>,
}

/// Inventory query filter. All criteria optional; absent means any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityFilter {
    pub gpu_model: Option<String>,
    pub min_vram_mb: Option<u64>,
    pub min_gpu_count: Option<u32>,
}

impl Provider {
    /// Whether this provider can serve the filter: Idle, with enough
    /// healthy GPUs matching the model and VRAM ask.
    pub fn matches(&self, filter: &AvailabilityFilter) -> bool {
        if self.status != ProviderStatus::Idle {
            return false;
        }

        let matching = self
            .gpus
            .iter()
            .filter(|gpu| {
                gpu.healthy
                    && filter
                        .gpu_model
                        .as_ref()
                        .map_or(true, |model| gpu.model.eq_ignore_ascii_case(model))
                    && filter.min_vram_mb.map_or(true, |vram| gpu.vram_mb >= vram)
            })
            .count() as u32;

        matching >= filter.min_gpu_count.unwrap_or(1).max(1)
    }

    /// The GPU that would be allocated for the filter, if any.
    pub fn best_gpu(&self, filter: &AvailabilityFilter) -> Option<&GpuDevice> {
        self.gpus
            .iter()
            .filter(|gpu| {
                gpu.healthy
                    && filter
                        .gpu_model
                        .as_ref()
                        .map_or(true, |model| gpu.model.eq_ignore_ascii_case(model))
                    && filter.min_vram_mb.map_or(true, |vram| gpu.vram_mb >= vram)
            })
            .min_by_key(|gpu| gpu.vram_mb)
    }
}
