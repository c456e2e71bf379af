use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::models::{DeviceAddress, Sighting, TransportKind};

use super::{
    is_network_url, Discoverer, DiscovererState, ScanClock, ScanController, SightingSink,
    STOP_TIMEOUT,
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const SSDP_MULTICAST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);
pub const PHYSICAL_WEB_SSDP_TYPE: &str = "urn:physical-web-org:device:Basic:1";
const MX_SECONDS: u8 = 2;
const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdpKind {
    Search,
    Notify,
    Found,
}

impl SsdpKind {
    fn start_line(self) -> &'static str {
        match self {
            SsdpKind::Search => "M-SEARCH * HTTP/1.1",
            SsdpKind::Notify => "NOTIFY * HTTP/1.1",
            SsdpKind::Found => "HTTP/1.1 200 OK",
        }
    }
}

/// An SSDP datagram. Header names are stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpMessage {
    pub kind: SsdpKind,
    headers: BTreeMap<String, String>,
}

impl SsdpMessage {
    pub fn new(kind: SsdpKind) -> Self {
        Self {
            kind,
            headers: BTreeMap::new(),
        }
    }

    pub fn search(search_target: &str, host: SocketAddr) -> Self {
        let mut message = Self::new(SsdpKind::Search);
        message.insert("HOST", host.to_string());
        message.insert("MAN", "\"ssdp:discover\"");
        message.insert("MX", MX_SECONDS.to_string());
        message.insert("ST", search_target);
        message
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.split("\r\n");
        let first = lines.next()?.trim();
        let kind = if first.starts_with("M-SEARCH") {
            SsdpKind::Search
        } else if first.starts_with("NOTIFY") {
            SsdpKind::Notify
        } else if first.starts_with("HTTP/1.1 200") {
            SsdpKind::Found
        } else {
            return None;
        };

        let mut message = Self::new(kind);
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() {
                    message.insert(key, value.trim());
                }
            }
        }
        Some(message)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.headers.insert(key.to_ascii_uppercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_uppercase()).map(String::as_str)
    }

    /// Advertised URL when this message announces a Physical Web device.
    /// Search responses carry the type in `ST`, announcements in `NT`.
    pub fn physical_web_location(&self) -> Option<&str> {
        let target = match self.kind {
            SsdpKind::Found => self.get("ST"),
            SsdpKind::Notify if self.get("NTS") != Some("ssdp:byebye") => self.get("NT"),
            _ => None,
        }?;
        if target != PHYSICAL_WEB_SSDP_TYPE {
            return None;
        }
        self.get("LOCATION").filter(|url| is_network_url(url))
    }
}

impl fmt::Display for SsdpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.kind.start_line())?;
        for (key, value) in &self.headers {
            write!(f, "{key}: {value}\r\n")?;
        }
        f.write_str("\r\n")
    }
}

pub struct SsdpDiscoverer {
    target: SocketAddr,
    search_interval: Duration,
    controller: ScanController,
}

impl SsdpDiscoverer {
    pub fn new() -> Self {
        Self::with_target(SocketAddr::V4(SSDP_MULTICAST), Duration::from_secs(10))
    }

    /// Searches `target` instead of the SSDP multicast group.
    pub fn with_target(target: SocketAddr, search_interval: Duration) -> Self {
        Self {
            target,
            search_interval,
            controller: ScanController::new("ssdp"),
        }
    }
}

impl Default for SsdpDiscoverer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discoverer for SsdpDiscoverer {
    fn transport(&self) -> TransportKind {
        TransportKind::Ssdp
    }

    fn state(&self) -> DiscovererState {
        self.controller.state()
    }

    async fn start(&self, sink: SightingSink) -> Result<()> {
        let Some(token) = self.controller.begin_start() else {
            return Ok(());
        };

        let bind_addr: SocketAddr = if self.target.ip().is_loopback() {
            (Ipv4Addr::LOCALHOST, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(err) => {
                self.controller.abort_start();
                return Err(err).context("failed to bind ssdp socket");
            }
        };

        let search = SsdpMessage::search(PHYSICAL_WEB_SSDP_TYPE, self.target).to_string();
        let handle = tokio::spawn(search_loop(
            socket,
            self.target,
            search,
            self.search_interval,
            sink,
            token.clone(),
        ));
        if let Err(handle) = self.controller.mark_running(&token, handle) {
            handle.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.controller.stop(STOP_TIMEOUT).await;
        Ok(())
    }
}

async fn search_loop(
    socket: UdpSocket,
    target: SocketAddr,
    search: String,
    search_interval: Duration,
    sink: SightingSink,
    cancel_token: CancellationToken,
) {
    let clock = ScanClock::start();
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut next_search = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_search) => {
                if let Err(err) = socket.send_to(search.as_bytes(), target).await {
                    log_warn!("ssdp search to {target} failed: {err}");
                }
                // Jitter keeps several scanners on one network from searching in lockstep.
                let jitter = rand::thread_rng().gen_range(0..=MX_SECONDS as u64 * 500);
                next_search = tokio::time::Instant::now() + search_interval + Duration::from_millis(jitter);
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        log_warn!("ssdp receive failed: {err}");
                        continue;
                    }
                };
                let text = String::from_utf8_lossy(&buf[..len]);
                match SsdpMessage::parse(&text).as_ref().and_then(SsdpMessage::physical_web_location) {
                    Some(url) => {
                        let sighting = Sighting::builder(TransportKind::Ssdp, url)
                            .address(DeviceAddress::rotating(from.to_string()))
                            .scan_offset_ms(clock.offset_ms())
                            .build();
                        if !sink.report(sighting) {
                            break;
                        }
                    }
                    None => sink.reject(),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("ssdp search loop shutting down");
                break;
            }
        }
    }
}
