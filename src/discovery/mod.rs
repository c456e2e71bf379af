//! Transport discoverers. Each one scans on its own task or thread and
//! reports decoded sightings into a shared [`SightingSink`].

pub mod ble;
mod controller;
pub mod mdns;
pub mod ssdp;
pub mod wifi_direct;

pub use controller::ScanController;

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::metrics::ScanMetrics;
use crate::models::{Sighting, TransportKind};

/// Upper bound on how long `stop` waits for a scan task to wind down.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscovererState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for DiscovererState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiscovererState::Stopped => "stopped",
            DiscovererState::Starting => "starting",
            DiscovererState::Running => "running",
            DiscovererState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// A source of sightings.
///
/// `start` and `stop` are no-ops when the discoverer is already in (or
/// heading to) the requested state. A failed `start` leaves it stopped; the
/// caller logs the error and carries on without that transport.
#[async_trait]
pub trait Discoverer: Send + Sync {
    fn transport(&self) -> TransportKind;

    fn state(&self) -> DiscovererState;

    async fn start(&self, sink: SightingSink) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Milliseconds since a discoverer started its current scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanClock {
    started: Instant,
}

impl ScanClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn offset_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Where discoverers deliver sightings. Cloned into every scan task.
#[derive(Clone)]
pub struct SightingSink {
    tx: mpsc::UnboundedSender<Sighting>,
    metrics: ScanMetrics,
}

impl SightingSink {
    pub fn new(tx: mpsc::UnboundedSender<Sighting>, metrics: ScanMetrics) -> Self {
        Self { tx, metrics }
    }

    /// Returns false once nobody is listening any more.
    pub fn report(&self, sighting: Sighting) -> bool {
        let transport = sighting.transport();
        if self.tx.send(sighting).is_err() {
            self.metrics.record_dropped();
            return false;
        }
        self.metrics.record_sighting(transport);
        true
    }

    /// Counts an advertisement that was malformed or filtered out.
    pub fn reject(&self) {
        self.metrics.record_decode_failure();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Only network URLs are worth handing to the rest of the pipeline.
pub(crate) fn is_network_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("http://")
        .or_else(|| lower.strip_prefix("https://"));
    rest.is_some_and(|host| !host.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_counts_sightings_and_drops() {
        let metrics = ScanMetrics::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = SightingSink::new(tx, metrics.clone());

        assert!(sink.report(Sighting::builder(TransportKind::Ssdp, "http://a.com").build()));
        sink.reject();
        assert!(rx.try_recv().is_ok());

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.report(Sighting::builder(TransportKind::Ssdp, "http://b.com").build()));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sighting_count(), 1);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.dropped_sightings, 1);
    }

    #[test]
    fn network_urls_only() {
        assert!(is_network_url("http://example.com"));
        assert!(is_network_url("HTTPS://example.com/x"));
        assert!(!is_network_url("https://"));
        assert!(!is_network_url("urn:uuid:00112233-4455-6677-8899-aabbccddeeff"));
        assert!(!is_network_url("ftp://example.com"));
    }
}
