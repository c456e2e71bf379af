use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::metrics::ScanMetrics;

/// Icons bigger than this are not worth keeping next to a title.
const MAX_ICON_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub enum IconEvent {
    Fetched { icon_url: String, bytes: Vec<u8> },
    Failed { icon_url: String, reason: String },
}

/// Fetches site icons independently of metadata resolution.
///
/// Each icon URL is fetched at most once per scan; `clear` forgets what was
/// already requested so a fresh scan fetches again.
pub struct IconFetcher {
    http: Client,
    seen: Arc<Mutex<HashSet<String>>>,
    metrics: ScanMetrics,
}

impl IconFetcher {
    pub fn new(http: Client, metrics: ScanMetrics) -> Self {
        Self {
            http,
            seen: Arc::new(Mutex::new(HashSet::new())),
            metrics,
        }
    }

    /// Returns immediately. Returns false when the URL was already requested.
    pub async fn ensure_icon(
        &self,
        icon_url: &str,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<IconEvent>,
    ) -> bool {
        if !self.should_fetch(icon_url).await {
            return false;
        }

        let icon_url = icon_url.to_string();
        let http = self.http.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = fetch_icon(&http, &icon_url) => result,
            };
            let event = match result {
                Ok(bytes) => {
                    metrics.record_icon();
                    log::debug!("Fetched icon {} ({} bytes)", icon_url, bytes.len());
                    IconEvent::Fetched { icon_url, bytes }
                }
                Err(err) => {
                    log::debug!("Icon fetch failed for {}: {}", icon_url, err);
                    IconEvent::Failed {
                        icon_url,
                        reason: err.to_string(),
                    }
                }
            };
            let _ = events.send(event);
        });
        true
    }

    async fn should_fetch(&self, icon_url: &str) -> bool {
        let mut seen = self.seen.lock().await;
        seen.insert(icon_url.to_string())
    }

    pub async fn clear(&self) {
        self.seen.lock().await.clear();
        log::debug!("Cleared icon fetch history");
    }
}

async fn fetch_icon(http: &Client, icon_url: &str) -> Result<Vec<u8>> {
    let response = http.get(icon_url).send().await?;
    if !response.status().is_success() {
        bail!("HTTP {}", response.status().as_u16());
    }
    let bytes = response.bytes().await?;
    if bytes.len() > MAX_ICON_BYTES {
        bail!("icon is {} bytes", bytes.len());
    }
    validate_image(&bytes)?;
    Ok(bytes.to_vec())
}

/// Accepts only payloads that decode as an image.
fn validate_image(bytes: &[u8]) -> Result<()> {
    image::guess_format(bytes).map_err(|err| anyhow!("unrecognized image format: {err}"))?;
    image::load_from_memory(bytes).map_err(|err| anyhow!("undecodable image: {err}"))?;
    Ok(())
}
