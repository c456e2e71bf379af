use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::wire::{MetadataItem, RequestObject, ResolveRequest, ResolveResponse};
use super::ResolveError;
use crate::metrics::{ResolutionSample, ScanMetrics};
use crate::models::{Identity, Record, ResolvedMetadata};
use crate::{log_info, log_warn};

const ENABLE_LOGS: bool = true;

pub const DEFAULT_ENDPOINT: &str = "https://url-caster.appspot.com";
pub const DEFAULT_RESOLVE_PATH: &str = "resolve-scan";

/// Where batches are posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub path: String,
    pub api_key: Option<String>,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    pub fn resolve_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT, DEFAULT_RESOLVE_PATH)
    }
}

/// Groups requests so their owner can cancel all of them at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTag(Uuid);

impl RequestTag {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One URL to resolve, remembered with the record it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveItem {
    pub identity: Identity,
    pub url: String,
    pub rssi: Option<i16>,
    pub tx_power: Option<i8>,
}

impl ResolveItem {
    pub fn from_record(record: &Record) -> Self {
        let data = record.sighting().data();
        Self {
            identity: record.identity().clone(),
            url: record.url().to_string(),
            rssi: data.rssi,
            tx_power: data.tx_power,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResolveEvent {
    Metadata {
        identity: Identity,
        metadata: ResolvedMetadata,
    },
    /// The service answered but said nothing about this URL.
    Absent { identity: Identity, url: String },
    /// The whole batch failed. Carries every item so the caller can retry.
    Error {
        batch: Vec<ResolveItem>,
        error: ResolveError,
    },
}

/// Builds the HTTP client shared by resolution and icon fetches.
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("nearcast/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

pub struct ResolutionClient {
    http: Client,
    endpoint: RwLock<Endpoint>,
    tags: Mutex<HashMap<RequestTag, CancellationToken>>,
    metrics: ScanMetrics,
}

impl ResolutionClient {
    pub fn new(http: Client, endpoint: Endpoint, metrics: ScanMetrics) -> Self {
        Self {
            http,
            endpoint: RwLock::new(endpoint),
            tags: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self.endpoint.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies to requests issued after the call; in-flight ones keep the old endpoint.
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        log_info!("Resolution endpoint set to {}", endpoint.resolve_url());
        match self.endpoint.write() {
            Ok(mut guard) => *guard = endpoint,
            Err(poisoned) => *poisoned.into_inner() = endpoint,
        }
    }

    fn tags(&self) -> MutexGuard<'_, HashMap<RequestTag, CancellationToken>> {
        match self.tags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn token_for(&self, tag: &RequestTag) -> CancellationToken {
        self.tags()
            .entry(*tag)
            .or_insert_with(CancellationToken::new)
            .child_token()
    }

    /// Cancels every outstanding request issued under `tag`. Cancelled
    /// requests deliver nothing. Later requests with the same tag run normally.
    pub fn cancel_all(&self, tag: &RequestTag) {
        if let Some(token) = self.tags().remove(tag) {
            log::debug!("Cancelling resolution requests tagged {tag}");
            token.cancel();
        }
    }

    /// Posts one batch and returns immediately. Results arrive on `events`:
    /// one `Metadata` or `Absent` per distinct identity, or a single `Error`.
    pub fn resolve(
        &self,
        batch: Vec<ResolveItem>,
        tag: &RequestTag,
        events: mpsc::UnboundedSender<ResolveEvent>,
    ) -> JoinHandle<()> {
        let cancel = self.token_for(tag);
        let http = self.http.clone();
        let endpoint = self.endpoint();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            if batch.is_empty() {
                return;
            }
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ResolveError::Cancelled),
                result = send_batch(&http, &endpoint, &batch) => result,
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            if cancel.is_cancelled() {
                log::debug!("Dropping resolution of {} urls after cancel", batch.len());
                return;
            }

            let mut sample = ResolutionSample {
                timestamp: Utc::now(),
                batch_size: batch.len(),
                latency_ms,
                echoed: 0,
                absent: 0,
                error_status: None,
            };

            match outcome {
                Ok(values) => {
                    let results = match_response(batch, values, latency_ms);
                    for event in &results {
                        match event {
                            ResolveEvent::Metadata { .. } => sample.echoed += 1,
                            ResolveEvent::Absent { .. } => sample.absent += 1,
                            ResolveEvent::Error { .. } => {}
                        }
                    }
                    metrics.record_resolution(sample);
                    for event in results {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(error) => {
                    log_warn!(
                        "Resolution of {} urls failed after {}ms: {}",
                        batch.len(),
                        latency_ms,
                        error
                    );
                    sample.error_status = Some(error.status_code());
                    metrics.record_resolution(sample);
                    let _ = events.send(ResolveEvent::Error { batch, error });
                }
            }
        })
    }
}

async fn send_batch(
    http: &Client,
    endpoint: &Endpoint,
    batch: &[ResolveItem],
) -> Result<Vec<serde_json::Value>, ResolveError> {
    let request = ResolveRequest {
        objects: batch
            .iter()
            .map(|item| RequestObject {
                url: &item.url,
                rssi: item.rssi,
                tx_power: item.tx_power,
            })
            .collect(),
    };

    let mut builder = http.post(endpoint.resolve_url()).json(&request);
    if let Some(key) = &endpoint.api_key {
        builder = builder.query(&[("key", key)]);
    }

    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ResolveError::Status(status.as_u16()));
    }

    let body: ResolveResponse = response
        .json()
        .await
        .map_err(|err| ResolveError::Decode(err.to_string()))?;
    Ok(body.metadata)
}

/// Pairs response items with the batch by echoed id. Items that fail to
/// deserialize are skipped, so their URLs come back absent.
fn match_response(
    batch: Vec<ResolveItem>,
    values: Vec<serde_json::Value>,
    latency_ms: u64,
) -> Vec<ResolveEvent> {
    let mut echoed: HashMap<String, MetadataItem> = HashMap::new();
    for value in values {
        match MetadataItem::from_value(value) {
            Ok(item) => {
                echoed.entry(item.id.clone()).or_insert(item);
            }
            Err(err) => log_warn!("Skipping malformed metadata item: {err}"),
        }
    }

    let mut delivered = HashSet::new();
    batch
        .into_iter()
        .filter(|item| delivered.insert(item.identity.clone()))
        .map(|item| match echoed.get(&item.url) {
            Some(found) => ResolveEvent::Metadata {
                identity: item.identity,
                metadata: found.clone().into_metadata(latency_ms),
            },
            None => ResolveEvent::Absent {
                identity: item.identity,
                url: item.url,
            },
        })
        .collect()
}
