use serde::{Deserialize, Serialize};

use super::Sighting;

/// Rank given to locally described entries the service never saw.
pub const TRANSPORT_ONLY_RANK: f64 = 0.5;

/// Metadata the resolution service returned for a broadcast URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMetadata {
    /// URL as broadcast, echoed back by the service as the item id.
    pub request_url: String,
    /// URL after redirects or shortener expansion.
    pub site_url: String,
    pub display_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Vec<u8>>,
    pub rank: f64,
    pub group_id: Option<String>,
    pub latency_ms: u64,
}

impl ResolvedMetadata {
    /// Group id, treating the empty string as "no group".
    pub fn group(&self) -> Option<&str> {
        self.group_id.as_deref().filter(|group| !group.is_empty())
    }

    /// Metadata built only from what the transport itself carried.
    pub fn transport_only(sighting: &Sighting) -> Self {
        let data = sighting.data();
        Self {
            request_url: sighting.url().to_string(),
            site_url: sighting.url().to_string(),
            display_url: sighting.url().to_string(),
            title: data.title.clone(),
            description: data.description.clone(),
            icon_url: None,
            icon: None,
            rank: TRANSPORT_ONLY_RANK,
            group_id: None,
            latency_ms: 0,
        }
    }
}
