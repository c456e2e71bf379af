use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::frame::{parse_scan_record, BeaconFrame};
use crate::models::{DeviceAddress, Sighting, TransportKind};

use super::{
    is_network_url, Discoverer, DiscovererState, ScanClock, ScanController, SightingSink,
    STOP_TIMEOUT,
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const FAT_BEACON_DESCRIPTION: &str = "Broadcast content served by the beacon";

/// One advertisement as delivered by the radio stack.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub rssi: i16,
    pub scan_record: Vec<u8>,
}

/// The platform radio. Bring-up and permissions are its business; this side
/// only starts and stops the scan and reads advertisements.
#[async_trait]
pub trait RadioScanner: Send + Sync {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>>;

    async fn stop_scan(&self) -> Result<()>;
}

pub struct BleDiscoverer {
    scanner: Arc<dyn RadioScanner>,
    fat_beacons: bool,
    controller: ScanController,
}

impl BleDiscoverer {
    pub fn new(scanner: Arc<dyn RadioScanner>, fat_beacons: bool) -> Self {
        Self {
            scanner,
            fat_beacons,
            controller: ScanController::new("ble"),
        }
    }
}

#[async_trait]
impl Discoverer for BleDiscoverer {
    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn state(&self) -> DiscovererState {
        self.controller.state()
    }

    async fn start(&self, sink: SightingSink) -> Result<()> {
        let Some(token) = self.controller.begin_start() else {
            return Ok(());
        };

        let advertisements = match self.scanner.start_scan().await {
            Ok(rx) => rx,
            Err(err) => {
                self.controller.abort_start();
                return Err(err).context("radio scan failed to start");
            }
        };

        let clock = ScanClock::start();
        let fat_beacons = self.fat_beacons;
        let handle = tokio::spawn(scan_loop(advertisements, sink, clock, fat_beacons, token.clone()));
        if let Err(handle) = self.controller.mark_running(&token, handle) {
            // Stopped while the radio was coming up.
            handle.abort();
            self.scanner
                .stop_scan()
                .await
                .context("radio scan failed to stop")?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.controller.stop(STOP_TIMEOUT).await {
            self.scanner
                .stop_scan()
                .await
                .context("radio scan failed to stop")?;
        }
        Ok(())
    }
}

async fn scan_loop(
    mut advertisements: mpsc::Receiver<Advertisement>,
    sink: SightingSink,
    clock: ScanClock,
    fat_beacons: bool,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            advertisement = advertisements.recv() => {
                let Some(advertisement) = advertisement else {
                    log_warn!("radio closed the advertisement stream");
                    break;
                };
                match sighting_from_advertisement(&advertisement, &clock, fat_beacons) {
                    Some(sighting) => {
                        if !sink.report(sighting) {
                            break;
                        }
                    }
                    None => sink.reject(),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("ble scan loop shutting down");
                break;
            }
        }
    }
}

/// Turns a raw advertisement into a sighting, or `None` when it carries no
/// usable URL.
pub fn sighting_from_advertisement(
    advertisement: &Advertisement,
    clock: &ScanClock,
    fat_beacons: bool,
) -> Option<Sighting> {
    let frame = match parse_scan_record(&advertisement.scan_record) {
        Ok(frame) => frame,
        Err(err) => {
            log::trace!("dropping advertisement from {}: {err}", advertisement.address);
            return None;
        }
    };

    match frame {
        BeaconFrame::FatBeacon { title, tx_power } if fat_beacons => Some(
            // The page lives on the beacon, so its address is the only locator.
            Sighting::builder(TransportKind::FatBeacon, advertisement.address.clone())
                .address(DeviceAddress::stable(advertisement.address.clone()))
                .rssi(advertisement.rssi)
                .tx_power(tx_power)
                .title(title)
                .description(FAT_BEACON_DESCRIPTION)
                .scan_offset_ms(clock.offset_ms())
                .private()
                .build(),
        ),
        BeaconFrame::FatBeacon { .. } => None,
        BeaconFrame::Url { url, tx_power, .. } => {
            if !is_network_url(&url) {
                log::trace!("ignoring non-network url {url}");
                return None;
            }
            Some(
                Sighting::builder(TransportKind::Ble, url)
                    .address(DeviceAddress::rotating(advertisement.address.clone()))
                    .rssi(advertisement.rssi)
                    .tx_power(tx_power)
                    .scan_offset_ms(clock.offset_ms())
                    .build(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::codec::frame::{build_advertisement, FrameFormat};
    use crate::metrics::ScanMetrics;

    struct ChannelScanner {
        advertisements: Mutex<Option<mpsc::Receiver<Advertisement>>>,
        fail: bool,
    }

    #[async_trait]
    impl RadioScanner for ChannelScanner {
        async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>> {
            if self.fail {
                anyhow::bail!("bluetooth is off");
            }
            self.advertisements
                .lock()
                .unwrap()
                .take()
                .context("scan already started")
        }

        async fn stop_scan(&self) -> Result<()> {
            Ok(())
        }
    }

    fn advertisement(url: &str) -> Advertisement {
        Advertisement {
            address: "AA:BB:CC:DD:EE:FF".into(),
            rssi: -60,
            scan_record: build_advertisement(FrameFormat::Eddystone, url, -20).unwrap(),
        }
    }

    #[test]
    fn url_frames_become_rotating_address_sightings() {
        let clock = ScanClock::start();
        let sighting = sighting_from_advertisement(&advertisement("https://example.com"), &clock, false)
            .unwrap();
        assert_eq!(sighting.url(), "https://example.com");
        assert_eq!(sighting.transport(), TransportKind::Ble);
        assert_eq!(sighting.data().rssi, Some(-60));
        assert_eq!(sighting.data().tx_power, Some(-20));
        assert!(!sighting.data().address.as_ref().unwrap().stable);
    }

    #[test]
    fn uuid_urls_and_garbage_are_dropped() {
        let clock = ScanClock::start();
        let urn = advertisement("urn:uuid:00112233-4455-6677-8899-aabbccddeeff");
        assert!(sighting_from_advertisement(&urn, &clock, false).is_none());

        let garbage = Advertisement {
            address: "x".into(),
            rssi: -90,
            scan_record: vec![0x09, 0x01],
        };
        assert!(sighting_from_advertisement(&garbage, &clock, false).is_none());
    }

    #[test]
    fn fat_beacons_need_opt_in() {
        let clock = ScanClock::start();
        let record = vec![0x03, 0x03, 0xaa, 0xfe, 0x0a, 0x16, 0xaa, 0xfe, 0x10, 0xf0, 0x0e, b'M', b'e', b'n', b'u'];
        let advertisement = Advertisement {
            address: "11:22".into(),
            rssi: -50,
            scan_record: record,
        };

        assert!(sighting_from_advertisement(&advertisement, &clock, false).is_none());
        let sighting = sighting_from_advertisement(&advertisement, &clock, true).unwrap();
        assert_eq!(sighting.transport(), TransportKind::FatBeacon);
        assert_eq!(sighting.url(), "11:22");
        assert_eq!(sighting.data().title.as_deref(), Some("Menu"));
        assert!(!sighting.is_resolvable());
    }

    #[tokio::test]
    async fn scans_until_stopped() {
        let (adv_tx, adv_rx) = mpsc::channel(8);
        let discoverer = BleDiscoverer::new(
            Arc::new(ChannelScanner {
                advertisements: Mutex::new(Some(adv_rx)),
                fail: false,
            }),
            false,
        );
        let metrics = ScanMetrics::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        discoverer.start(SightingSink::new(tx.clone(), metrics.clone())).await.unwrap();
        // Second start is a no-op.
        discoverer.start(SightingSink::new(tx, metrics.clone())).await.unwrap();
        assert_eq!(discoverer.state(), DiscovererState::Running);

        adv_tx.send(advertisement("http://example.com")).await.unwrap();
        adv_tx
            .send(Advertisement {
                address: "x".into(),
                rssi: 0,
                scan_record: vec![],
            })
            .await
            .unwrap();
        adv_tx.send(advertisement("https://example.org")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().url(), "http://example.com");
        assert_eq!(rx.recv().await.unwrap().url(), "https://example.org");
        assert_eq!(metrics.snapshot().decode_failures, 1);

        discoverer.stop().await.unwrap();
        discoverer.stop().await.unwrap();
        assert_eq!(discoverer.state(), DiscovererState::Stopped);
    }

    /// Takes a while to bring the radio up and counts how often it is
    /// switched off.
    #[derive(Default)]
    struct SlowScanner {
        stops: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RadioScanner for SlowScanner {
        async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn stop_scan(&self) -> Result<()> {
            self.stops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_while_starting_leaves_the_radio_off() {
        let scanner = Arc::new(SlowScanner::default());
        let discoverer = Arc::new(BleDiscoverer::new(scanner.clone(), false));
        let (tx, _rx) = mpsc::unbounded_channel();

        let starting = {
            let discoverer = discoverer.clone();
            let sink = SightingSink::new(tx.clone(), ScanMetrics::new());
            tokio::spawn(async move { discoverer.start(sink).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(discoverer.state(), DiscovererState::Starting);
        discoverer.stop().await.unwrap();
        starting.await.unwrap().unwrap();

        assert_eq!(discoverer.state(), DiscovererState::Stopped);
        // Once from stop, once more when the late start noticed.
        assert_eq!(scanner.stops.load(std::sync::atomic::Ordering::SeqCst), 2);

        discoverer.start(SightingSink::new(tx, ScanMetrics::new())).await.unwrap();
        assert_eq!(discoverer.state(), DiscovererState::Running);
        discoverer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_leaves_discoverer_stopped() {
        let discoverer = BleDiscoverer::new(
            Arc::new(ChannelScanner {
                advertisements: Mutex::new(None),
                fail: true,
            }),
            false,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = discoverer.start(SightingSink::new(tx, ScanMetrics::new())).await;
        assert!(result.is_err());
        assert_eq!(discoverer.state(), DiscovererState::Stopped);
    }
}
