use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed resolution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionSample {
    pub timestamp: DateTime<Utc>,
    pub batch_size: usize,
    pub latency_ms: u64,
    pub echoed: usize,
    pub absent: usize,
    /// HTTP status of a failed batch; 0 when the failure had no status.
    pub error_status: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub sightings: BTreeMap<String, u64>,
    pub decode_failures: u64,
    pub dropped_sightings: u64,
    pub resolved_count: u64,
    pub absent_count: u64,
    pub resolution_error_count: u64,
    pub icon_count: u64,
    pub last_resolution_ms: Option<u64>,
    pub recent_resolutions: Vec<ResolutionSample>,
}

impl MetricsSnapshot {
    pub fn sighting_count(&self) -> u64 {
        self.sightings.values().sum()
    }
}
