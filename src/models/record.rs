use serde::{Deserialize, Serialize};

use super::{Identity, ResolvedMetadata, Sighting};

/// Per-identity state: the latest sighting plus whatever metadata arrived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub(crate) identity: Identity,
    pub(crate) sighting: Sighting,
    pub(crate) metadata: Option<ResolvedMetadata>,
    pub(crate) smoothed_rssi: Option<f64>,
    pub(crate) distance_m: Option<f64>,
}

impl Record {
    pub(crate) fn new(identity: Identity, sighting: Sighting) -> Self {
        Self {
            identity,
            sighting,
            metadata: None,
            smoothed_rssi: None,
            distance_m: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn sighting(&self) -> &Sighting {
        &self.sighting
    }

    pub fn url(&self) -> &str {
        self.sighting.url()
    }

    pub fn metadata(&self) -> Option<&ResolvedMetadata> {
        self.metadata.as_ref()
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|meta| meta.title.as_deref())
    }

    pub fn group(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(ResolvedMetadata::group)
    }

    pub fn smoothed_rssi(&self) -> Option<f64> {
        self.smoothed_rssi
    }

    pub fn distance_m(&self) -> Option<f64> {
        self.distance_m
    }
}
