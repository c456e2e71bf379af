//! What gets persisted between runs and the rules for trusting it again.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::collection::Collection;
use crate::models::Record;

/// Bumped whenever the serialized record layout changes. Snapshots written
/// under any other version are thrown away whole.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_secs(120);
pub const DEFAULT_LOCAL_STALE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindows {
    /// Past this age the whole snapshot is discarded.
    pub stale: Duration,
    /// Past this age range-bound records are pruned from an otherwise fresh snapshot.
    pub local_stale: Duration,
}

impl Default for CacheWindows {
    fn default() -> Self {
        Self {
            stale: DEFAULT_STALE_WINDOW,
            local_stale: DEFAULT_LOCAL_STALE_WINDOW,
        }
    }
}

/// Row as stored. Records stay encoded until the version has been checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub schema_version: u32,
    pub scan_start_ms: i64,
    pub records: Vec<u8>,
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn capture(scan_start_ms: i64, records: &[Record]) -> Result<Self> {
        let records = serde_json::to_vec(records).context("failed to serialize records")?;
        Ok(Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            scan_start_ms,
            records,
            saved_at: Utc::now(),
        })
    }

    pub fn decode_records(&self) -> Result<Vec<Record>, serde_json::Error> {
        serde_json::from_slice(&self.records)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheDiscard {
    #[error("snapshot schema v{found} does not match v{expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("snapshot is {age_ms}ms old")]
    Stale { age_ms: i64 },
    #[error("no snapshot stored")]
    Missing,
    #[error("snapshot unreadable: {0}")]
    Corrupt(String),
}

/// Result of loading the cache at start-up. Never an error: anything that
/// cannot be trusted turns into an empty collection and a fresh scan start.
#[derive(Debug)]
pub struct Restored {
    pub collection: Collection,
    pub scan_start_ms: i64,
    pub discarded: Option<CacheDiscard>,
    /// Range-bound records dropped from an otherwise fresh snapshot.
    pub pruned: usize,
}

impl Restored {
    fn fresh(now_ms: i64, reason: CacheDiscard) -> Self {
        Self {
            collection: Collection::new(),
            scan_start_ms: now_ms,
            discarded: Some(reason),
            pruned: 0,
        }
    }
}

pub fn restore(loaded: Result<Option<Snapshot>>, now_ms: i64, windows: CacheWindows) -> Restored {
    let snapshot = match loaded {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return Restored::fresh(now_ms, CacheDiscard::Missing),
        Err(err) => return Restored::fresh(now_ms, CacheDiscard::Corrupt(format!("{err:#}"))),
    };

    if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Restored::fresh(
            now_ms,
            CacheDiscard::VersionMismatch {
                found: snapshot.schema_version,
                expected: SNAPSHOT_SCHEMA_VERSION,
            },
        );
    }

    let age_ms = now_ms.saturating_sub(snapshot.scan_start_ms);
    if age_ms < 0 || age_ms >= window_ms(windows.stale) {
        return Restored::fresh(now_ms, CacheDiscard::Stale { age_ms });
    }

    let records = match snapshot.decode_records() {
        Ok(records) => records,
        Err(err) => return Restored::fresh(now_ms, CacheDiscard::Corrupt(err.to_string())),
    };

    let mut collection = Collection::from_records(records);
    let pruned = if age_ms >= window_ms(windows.local_stale) {
        collection
            .retain(|record| !record.sighting().transport().is_range_bound())
            .len()
    } else {
        0
    };

    Restored {
        collection,
        scan_start_ms: snapshot.scan_start_ms,
        discarded: None,
        pruned,
    }
}

fn window_ms(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}
