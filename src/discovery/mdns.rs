use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;

use crate::models::{DeviceAddress, Sighting, TransportKind};

use super::{
    is_network_url, Discoverer, DiscovererState, ScanClock, ScanController, SightingSink,
    STOP_TIMEOUT,
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const MDNS_SERVICE_TYPE: &str = "_http._tcp.local.";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The parts of a resolved DNS-SD service this transport cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub instance: String,
    pub hostname: String,
    pub port: u16,
    pub public: bool,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl ServiceAnnouncement {
    fn from_info(info: &ServiceInfo) -> Self {
        let fullname = info.get_fullname();
        let suffix = format!(".{}", info.get_type());
        let instance = fullname.strip_suffix(&suffix).unwrap_or(fullname);
        let txt = |key: &str| {
            info.get_property_val_str(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(String::from)
        };

        Self {
            instance: instance.to_string(),
            hostname: info.get_hostname().trim_end_matches('.').to_string(),
            port: info.get_port(),
            public: txt("public").is_some_and(|value| value.eq_ignore_ascii_case("true")),
            title: txt("title"),
            description: txt("description"),
        }
    }

    /// The instance name is the advertised URL. Public services go to the
    /// resolution service; everything else is described by its TXT record.
    pub fn to_sighting(&self, clock: &ScanClock) -> Option<Sighting> {
        if !is_network_url(&self.instance) {
            return None;
        }

        let sighting = if self.public {
            Sighting::builder(TransportKind::MdnsPublic, self.instance.clone())
        } else {
            let mut builder = Sighting::builder(TransportKind::MdnsLocal, self.instance.clone())
                .address(DeviceAddress::stable(self.hostname.clone()))
                .port(self.port)
                .private();
            if let Some(title) = &self.title {
                builder = builder.title(title.clone());
            }
            if let Some(description) = &self.description {
                builder = builder.description(description.clone());
            }
            builder
        };

        Some(sighting.scan_offset_ms(clock.offset_ms()).build())
    }
}

pub struct MdnsDiscoverer {
    controller: ScanController,
    daemon: Mutex<Option<ServiceDaemon>>,
}

impl MdnsDiscoverer {
    pub fn new() -> Self {
        Self {
            controller: ScanController::new("mdns"),
            daemon: Mutex::new(None),
        }
    }

    fn daemon(&self) -> MutexGuard<'_, Option<ServiceDaemon>> {
        match self.daemon.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MdnsDiscoverer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discoverer for MdnsDiscoverer {
    fn transport(&self) -> TransportKind {
        TransportKind::MdnsPublic
    }

    fn state(&self) -> DiscovererState {
        self.controller.state()
    }

    async fn start(&self, sink: SightingSink) -> Result<()> {
        let Some(token) = self.controller.begin_start() else {
            return Ok(());
        };

        let browse = ServiceDaemon::new()
            .map_err(|err| anyhow!("failed to create mdns daemon: {err}"))
            .and_then(|daemon| {
                let events = daemon
                    .browse(MDNS_SERVICE_TYPE)
                    .map_err(|err| anyhow!("failed to browse {MDNS_SERVICE_TYPE}: {err}"))?;
                Ok((daemon, events))
            });
        let (daemon, events) = match browse {
            Ok(pair) => pair,
            Err(err) => {
                self.controller.abort_start();
                return Err(err);
            }
        };

        let clock = ScanClock::start();
        let loop_token = token.clone();
        let handle = tokio::task::spawn_blocking(move || browse_loop(events, sink, clock, loop_token));
        *self.daemon() = Some(daemon);
        if self.controller.mark_running(&token, handle).is_err() {
            // The browse loop sees the cancelled token and exits on its own.
            if let Some(daemon) = self.daemon().take() {
                return shutdown_daemon(daemon);
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.controller.stop(STOP_TIMEOUT).await {
            return Ok(());
        }
        match self.daemon().take() {
            Some(daemon) => shutdown_daemon(daemon),
            None => Ok(()),
        }
    }
}

fn shutdown_daemon(daemon: ServiceDaemon) -> Result<()> {
    if let Err(err) = daemon.stop_browse(MDNS_SERVICE_TYPE) {
        log_warn!("failed to stop mdns browse: {err}");
    }
    daemon
        .shutdown()
        .map(|_| ())
        .map_err(|err| anyhow!("failed to shut down mdns daemon: {err}"))
}

fn browse_loop(
    events: mdns_sd::Receiver<ServiceEvent>,
    sink: SightingSink,
    clock: ScanClock,
    cancel_token: CancellationToken,
) {
    while !cancel_token.is_cancelled() {
        let event = match events.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(_) if events.is_disconnected() => {
                log_warn!("mdns daemon closed the browse channel");
                break;
            }
            Err(_) => continue,
        };

        match event {
            ServiceEvent::ServiceResolved(info) => {
                let announcement = ServiceAnnouncement::from_info(&info);
                match announcement.to_sighting(&clock) {
                    Some(sighting) => {
                        if !sink.report(sighting) {
                            break;
                        }
                    }
                    None => {
                        log::trace!("ignoring mdns service {}", announcement.instance);
                        sink.reject();
                    }
                }
            }
            ServiceEvent::SearchStarted(ty) => log::debug!("mdns search started for {ty}"),
            other => log::trace!("mdns event {other:?}"),
        }
    }
    log_info!("mdns browse loop shutting down");
}
