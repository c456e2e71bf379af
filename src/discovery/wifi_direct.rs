use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{DeviceAddress, Sighting, TransportKind};

use super::{
    is_network_url, Discoverer, DiscovererState, ScanClock, ScanController, SightingSink,
    STOP_TIMEOUT,
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const NAME_PREFIX: &str = "PW-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDevice {
    pub device_name: String,
    pub device_address: String,
}

/// Platform peer-to-peer discovery. Each message is the full peer list as
/// currently known.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn discover_peers(&self) -> Result<mpsc::Receiver<Vec<PeerDevice>>>;

    async fn stop_discovery(&self) -> Result<()>;
}

/// A peer name of the form `PW-<title or url>-<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiDirectName {
    pub title_or_url: String,
    pub port: u16,
}

pub fn parse_wifi_direct_name(name: &str) -> Option<WifiDirectName> {
    let rest = name.strip_prefix(NAME_PREFIX)?;
    let (title_or_url, port) = rest.rsplit_once('-')?;
    if title_or_url.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(WifiDirectName {
        title_or_url: title_or_url.to_string(),
        port: port.parse().ok()?,
    })
}

/// Port 0 means the peer simply advertises a URL. Anything else is a page
/// served by the peer itself on that port.
pub fn sighting_from_peer(peer: &PeerDevice, clock: &ScanClock) -> Option<Sighting> {
    let name = parse_wifi_direct_name(&peer.device_name)?;
    let builder = if name.port == 0 {
        if !is_network_url(&name.title_or_url) {
            return None;
        }
        Sighting::builder(TransportKind::WifiDirect, name.title_or_url)
    } else {
        let url = format!("wifidirect://{}:{}", peer.device_address, name.port);
        Sighting::builder(TransportKind::WifiDirect, url)
            .address(DeviceAddress::stable(peer.device_address.clone()))
            .port(name.port)
            .title(name.title_or_url)
            .description("")
            .private()
    };
    Some(builder.scan_offset_ms(clock.offset_ms()).build())
}

pub struct WifiDirectDiscoverer {
    peers: Arc<dyn PeerSource>,
    controller: ScanController,
}

impl WifiDirectDiscoverer {
    pub fn new(peers: Arc<dyn PeerSource>) -> Self {
        Self {
            peers,
            controller: ScanController::new("wifidirect"),
        }
    }
}

#[async_trait]
impl Discoverer for WifiDirectDiscoverer {
    fn transport(&self) -> TransportKind {
        TransportKind::WifiDirect
    }

    fn state(&self) -> DiscovererState {
        self.controller.state()
    }

    async fn start(&self, sink: SightingSink) -> Result<()> {
        let Some(token) = self.controller.begin_start() else {
            return Ok(());
        };
        let peer_lists = match self.peers.discover_peers().await {
            Ok(rx) => rx,
            Err(err) => {
                self.controller.abort_start();
                return Err(err).context("peer discovery failed to start");
            }
        };
        let handle = tokio::spawn(peer_loop(peer_lists, sink, token.clone()));
        if let Err(handle) = self.controller.mark_running(&token, handle) {
            handle.abort();
            self.peers
                .stop_discovery()
                .await
                .context("peer discovery failed to stop")?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.controller.stop(STOP_TIMEOUT).await {
            self.peers
                .stop_discovery()
                .await
                .context("peer discovery failed to stop")?;
        }
        Ok(())
    }
}

async fn peer_loop(
    mut peer_lists: mpsc::Receiver<Vec<PeerDevice>>,
    sink: SightingSink,
    cancel_token: CancellationToken,
) {
    let clock = ScanClock::start();
    loop {
        tokio::select! {
            peers = peer_lists.recv() => {
                let Some(peers) = peers else {
                    log_warn!("peer source closed its channel");
                    break;
                };
                for peer in &peers {
                    match sighting_from_peer(peer, &clock) {
                        Some(sighting) => {
                            if !sink.report(sighting) {
                                return;
                            }
                        }
                        None => sink.reject(),
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("wifidirect peer loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::metrics::ScanMetrics;
    use crate::models::Identity;

    struct ChannelPeers(Mutex<Option<mpsc::Receiver<Vec<PeerDevice>>>>);

    #[async_trait]
    impl PeerSource for ChannelPeers {
        async fn discover_peers(&self) -> Result<mpsc::Receiver<Vec<PeerDevice>>> {
            self.0.lock().unwrap().take().context("already discovering")
        }

        async fn stop_discovery(&self) -> Result<()> {
            Ok(())
        }
    }

    fn peer(name: &str) -> PeerDevice {
        PeerDevice {
            device_name: name.into(),
            device_address: "02:00:00:aa:bb:cc".into(),
        }
    }

    #[test]
    fn parses_names() {
        assert_eq!(
            parse_wifi_direct_name("PW-Team photos-1234"),
            Some(WifiDirectName {
                title_or_url: "Team photos".into(),
                port: 1234
            })
        );
        assert_eq!(
            parse_wifi_direct_name("PW-https://a-b.example-0").unwrap().title_or_url,
            "https://a-b.example"
        );
        assert_eq!(parse_wifi_direct_name("Android_1234"), None);
        assert_eq!(parse_wifi_direct_name("PW-title-"), None);
        assert_eq!(parse_wifi_direct_name("PW-title-99999"), None);
    }

    #[test]
    fn port_zero_advertises_a_resolvable_url() {
        let clock = ScanClock::start();
        let sighting = sighting_from_peer(&peer("PW-https://example.com-0"), &clock).unwrap();
        assert_eq!(sighting.url(), "https://example.com");
        assert!(sighting.is_resolvable());
        assert!(sighting_from_peer(&peer("PW-not a url-0"), &clock).is_none());
    }

    #[test]
    fn served_pages_are_local_only() {
        let clock = ScanClock::start();
        let sighting = sighting_from_peer(&peer("PW-Slides-8080"), &clock).unwrap();
        assert_eq!(sighting.url(), "wifidirect://02:00:00:aa:bb:cc:8080");
        assert_eq!(sighting.data().title.as_deref(), Some("Slides"));
        assert!(!sighting.is_resolvable());
        assert_eq!(
            Identity::of(&sighting),
            Identity::Address("02:00:00:aa:bb:cc#8080".into())
        );
    }

    #[tokio::test]
    async fn reports_every_matching_peer() {
        let (peers_tx, peers_rx) = mpsc::channel(4);
        let discoverer = WifiDirectDiscoverer::new(Arc::new(ChannelPeers(Mutex::new(Some(peers_rx)))));
        let metrics = ScanMetrics::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        discoverer.start(SightingSink::new(tx, metrics.clone())).await.unwrap();

        peers_tx
            .send(vec![peer("PW-Slides-8080"), peer("Printer"), peer("PW-http://x.com-0")])
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().data().title.as_deref(), Some("Slides"));
        assert_eq!(rx.recv().await.unwrap().url(), "http://x.com");
        assert_eq!(metrics.snapshot().decode_failures, 1);

        discoverer.stop().await.unwrap();
        assert_eq!(discoverer.state(), DiscovererState::Stopped);
    }
}
