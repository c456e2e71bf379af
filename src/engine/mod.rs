//! Wires discoverers, the collection, resolution, the cache and the feed
//! into one running scan.

mod events;
mod pump;

pub use events::{FeedEvent, Subscription};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::cache::{restore, CacheStore, Snapshot};
use crate::collection::Collection;
use crate::discovery::ble::{BleDiscoverer, RadioScanner};
use crate::discovery::mdns::MdnsDiscoverer;
use crate::discovery::ssdp::SsdpDiscoverer;
use crate::discovery::wifi_direct::{PeerSource, WifiDirectDiscoverer};
use crate::discovery::{Discoverer, DiscovererState, ScanController, SightingSink, STOP_TIMEOUT};
use crate::feed::{
    sort_records, DefaultOrder, FeedLayout, NotificationFeed, RankOrder, RelevanceOrder, RevealPhase,
};
use crate::metrics::{MetricsSnapshot, ScanMetrics};
use crate::models::{Identity, Record, Sighting};
use crate::resolve::{
    http_client, Endpoint, IconEvent, IconFetcher, RequestTag, ResolutionClient, ResolveEvent,
    ResolveItem,
};
use crate::settings::EngineSettings;
use crate::{log_info, log_warn};

use events::SubscriberGuard;
use pump::{Control, Receivers};

const ENABLE_LOGS: bool = true;

const EVENT_CAPACITY: usize = 256;

struct Senders {
    sightings: mpsc::UnboundedSender<Sighting>,
    resolved: mpsc::UnboundedSender<ResolveEvent>,
    icons: mpsc::UnboundedSender<IconEvent>,
    control: mpsc::UnboundedSender<Control>,
}

#[derive(Debug, Clone, Copy)]
struct ScanStart {
    epoch_ms: i64,
    instant: Instant,
}

impl ScanStart {
    fn now() -> Self {
        Self {
            epoch_ms: Utc::now().timestamp_millis(),
            instant: Instant::now(),
        }
    }

    /// Keeps a restored scan's epoch for cache staleness. The reveal
    /// windows still run from now.
    fn restored(epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            instant: Instant::now(),
        }
    }
}

pub(crate) struct Shared {
    settings: EngineSettings,
    collection: Mutex<Collection>,
    feed: Mutex<NotificationFeed>,
    relevance: RelevanceOrder,
    discoverers: Vec<Arc<dyn Discoverer>>,
    resolver: ResolutionClient,
    icons: IconFetcher,
    store: Option<CacheStore>,
    metrics: ScanMetrics,
    tag: RequestTag,
    network: StdMutex<CancellationToken>,
    events: broadcast::Sender<FeedEvent>,
    senders: Senders,
    receivers: StdMutex<Option<Receivers>>,
    pump: ScanController,
    scan: StdMutex<ScanStart>,
    subscribers: Arc<AtomicUsize>,
    settled: AtomicBool,
    idle: watch::Sender<bool>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct EngineBuilder {
    settings: EngineSettings,
    discoverers: Vec<Arc<dyn Discoverer>>,
    store: Option<CacheStore>,
}

impl EngineBuilder {
    pub fn discoverer(mut self, discoverer: Arc<dyn Discoverer>) -> Self {
        self.discoverers.push(discoverer);
        self
    }

    /// mDNS and SSDP, as enabled in the settings. Both run on plain sockets.
    pub fn network_discoverers(mut self) -> Self {
        if self.settings.mdns_enabled {
            self.discoverers.push(Arc::new(MdnsDiscoverer::new()));
        }
        if self.settings.ssdp_enabled {
            self.discoverers.push(Arc::new(SsdpDiscoverer::new()));
        }
        self
    }

    pub fn radio(mut self, scanner: Arc<dyn RadioScanner>) -> Self {
        if self.settings.ble_enabled {
            let fat_beacons = self.settings.fat_beacon_enabled;
            self.discoverers
                .push(Arc::new(BleDiscoverer::new(scanner, fat_beacons)));
        }
        self
    }

    pub fn peers(mut self, peers: Arc<dyn PeerSource>) -> Self {
        if self.settings.wifi_direct_enabled {
            self.discoverers
                .push(Arc::new(WifiDirectDiscoverer::new(peers)));
        }
        self
    }

    pub fn cache(mut self, store: CacheStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let metrics = ScanMetrics::new();
        let http = http_client(self.settings.request_timeout())?;
        let resolver = ResolutionClient::new(http.clone(), self.settings.endpoint(), metrics.clone());
        let icons = IconFetcher::new(http, metrics.clone());
        let relevance = RelevanceOrder::new(self.settings.favorites.iter().cloned());
        let feed = NotificationFeed::new(relevance.clone(), self.settings.blocked_hosts.iter().cloned());

        let (sightings_tx, sightings_rx) = mpsc::unbounded_channel();
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        let (icons_tx, icons_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (idle, _) = watch::channel(false);

        let shared = Shared {
            settings: self.settings,
            collection: Mutex::new(Collection::new()),
            feed: Mutex::new(feed),
            relevance,
            discoverers: self.discoverers,
            resolver,
            icons,
            store: self.store,
            metrics,
            tag: RequestTag::new(),
            network: StdMutex::new(CancellationToken::new()),
            events,
            senders: Senders {
                sightings: sightings_tx,
                resolved: resolved_tx,
                icons: icons_tx,
                control: control_tx,
            },
            receivers: StdMutex::new(Some(Receivers {
                sightings: sightings_rx,
                resolved: resolved_rx,
                icons: icons_rx,
                control: control_rx,
            })),
            pump: ScanController::new("engine"),
            scan: StdMutex::new(ScanStart::now()),
            subscribers: Arc::new(AtomicUsize::new(0)),
            settled: AtomicBool::new(false),
            idle,
        };

        Ok(Engine {
            shared: Arc::new(shared),
        })
    }
}

/// One scanning session: owns the collection and everything that feeds it.
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn builder(settings: EngineSettings) -> EngineBuilder {
        EngineBuilder {
            settings,
            discoverers: Vec::new(),
            store: None,
        }
    }

    /// Restores the cache, starts the event pump and every discoverer, and
    /// queues restored records that still need metadata. Discoverers that
    /// fail to start are logged and skipped.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let Some(cancel) = shared.pump.begin_start() else {
            return Ok(());
        };
        let Some(receivers) = lock(&shared.receivers).take() else {
            shared.pump.abort_start();
            bail!("engine event pump was lost; build a new engine");
        };

        shared.restore_cache().await;
        shared.feed.lock().await.reset();
        shared.settled.store(false, Ordering::SeqCst);
        shared.refresh_idle();

        let handle = tokio::spawn(pump::run(shared.clone(), receivers, cancel.clone()));
        if let Err(handle) = shared.pump.mark_running(&cancel, handle) {
            // Shut down mid-start. The pump exits on the cancelled token and
            // hands its channels back.
            let _ = handle.await;
            return Ok(());
        }

        shared.start_discoverers().await;
        shared.resolve_unresolved().await;
        shared.publish().await;
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        let weak = Arc::downgrade(&self.shared);
        let guard = SubscriberGuard::acquire(
            self.shared.subscribers.clone(),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.refresh_idle();
                }
            }),
        );
        self.shared.refresh_idle();
        Subscription::new(self.shared.events.subscribe(), guard)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::SeqCst)
    }

    /// Records with metadata, one per group, in the default order.
    pub async fn ranked_list(&self) -> Vec<Record> {
        self.ranked_list_by(&DefaultOrder).await
    }

    pub async fn ranked_list_by(&self, order: &dyn RankOrder) -> Vec<Record> {
        self.shared.ranked(order).await
    }

    /// Every record, resolved or not.
    pub async fn all_records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.shared.collection.lock().await.records().cloned().collect();
        sort_records(&mut records, &DefaultOrder);
        records
    }

    pub async fn record(&self, identity: &Identity) -> Option<Record> {
        self.shared.collection.lock().await.get(identity).cloned()
    }

    pub async fn notification(&self) -> FeedLayout {
        self.shared.feed.lock().await.layout().clone()
    }

    pub async fn phase(&self) -> RevealPhase {
        self.shared.feed.lock().await.phase()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn scan_start_ms(&self) -> i64 {
        lock(&self.shared.scan).epoch_ms
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.resolver.endpoint()
    }

    /// Sends a failed batch again. Nothing retries on its own.
    pub fn retry_resolution(&self, batch: Vec<ResolveItem>) {
        self.shared.request_resolution(batch);
    }

    /// Stops every discoverer, starts a new scan clock and scans again.
    /// Known records are kept.
    pub async fn restart_scan(&self) {
        let shared = &self.shared;
        shared.stop_discoverers().await;
        shared.cancel_network();
        shared.icons.clear().await;
        shared.begin_new_scan().await;
        if shared.pump.state() == DiscovererState::Running {
            shared.start_discoverers().await;
            shared.resolve_unresolved().await;
        }
        shared.publish().await;
    }

    /// Forgets every record, persists the empty state and scans again.
    pub async fn clear_cache(&self) {
        let shared = &self.shared;
        shared.stop_discoverers().await;
        shared.cancel_network();
        shared.icons.clear().await;
        shared.collection.lock().await.clear();
        shared.begin_new_scan().await;
        shared.flush().await;
        if shared.pump.state() == DiscovererState::Running {
            shared.start_discoverers().await;
        }
        shared.publish().await;
    }

    /// Metadata from another service is not comparable, so this also clears.
    pub async fn set_endpoint(&self, endpoint: Endpoint) {
        self.shared.resolver.set_endpoint(endpoint);
        self.clear_cache().await;
    }

    /// Resolves once the reveal windows have passed and nobody is subscribed.
    pub async fn idle(&self) {
        let mut idle = self.shared.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Stops discoverers, cancels this engine's outstanding requests and
    /// writes the collection to the cache, in that order. Failures are
    /// logged; the next start treats a missing cache as empty.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        log_info!("Engine shutting down");
        shared.stop_discoverers().await;
        shared.cancel_network();
        shared.pump.stop(STOP_TIMEOUT).await;
        shared.flush().await;
    }
}

impl Shared {
    fn emit(&self, event: FeedEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn network_token(&self) -> CancellationToken {
        lock(&self.network).child_token()
    }

    fn cancel_network(&self) {
        self.resolver.cancel_all(&self.tag);
        let mut network = lock(&self.network);
        network.cancel();
        *network = CancellationToken::new();
    }

    fn refresh_idle(&self) {
        let idle = self.settled.load(Ordering::SeqCst) && self.subscribers.load(Ordering::SeqCst) == 0;
        self.idle.send_replace(idle);
    }

    fn scan_start(&self) -> ScanStart {
        *lock(&self.scan)
    }

    async fn begin_new_scan(&self) {
        *lock(&self.scan) = ScanStart::now();
        self.feed.lock().await.reset();
        self.settled.store(false, Ordering::SeqCst);
        self.refresh_idle();
        self.emit(FeedEvent::PhaseChanged(RevealPhase::Closed));
        let _ = self.senders.control.send(Control::Reschedule);
    }

    async fn restore_cache(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let loaded = match &self.store {
            Some(store) => store.load_snapshot().await,
            None => Ok(None),
        };
        let restored = restore(loaded, now_ms, self.settings.cache_windows());
        match &restored.discarded {
            Some(reason) => log_info!("Starting with an empty collection: {reason}"),
            None => log_info!(
                "Restored {} cached records ({} out-of-range pruned)",
                restored.collection.len(),
                restored.pruned
            ),
        }
        *lock(&self.scan) = ScanStart::restored(restored.scan_start_ms);
        *self.collection.lock().await = restored.collection;
    }

    async fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let records: Vec<Record> = self.collection.lock().await.records().cloned().collect();
        let snapshot = match Snapshot::capture(self.scan_start().epoch_ms, &records) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::error!("Failed to capture cache snapshot: {err:#}");
                return;
            }
        };
        match store.save_snapshot(snapshot).await {
            Ok(()) => log::debug!("Cached {} records", records.len()),
            Err(err) => log::error!("Failed to flush cache: {err:#}"),
        }
    }

    async fn start_discoverers(&self) {
        for discoverer in &self.discoverers {
            let sink = SightingSink::new(self.senders.sightings.clone(), self.metrics.clone());
            if let Err(err) = discoverer.start(sink).await {
                log_warn!(
                    "{} discovery unavailable this session: {err:#}",
                    discoverer.transport()
                );
            }
        }
    }

    async fn stop_discoverers(&self) {
        for discoverer in &self.discoverers {
            match timeout(STOP_TIMEOUT * 2, discoverer.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log_warn!("{} discovery failed to stop: {err:#}", discoverer.transport()),
                Err(_) => log_warn!("{} discovery did not stop in time", discoverer.transport()),
            }
        }
    }

    fn request_resolution(&self, batch: Vec<ResolveItem>) {
        if batch.is_empty() {
            return;
        }
        log::debug!("Resolving {} urls", batch.len());
        // The task reports through the resolved channel; its handle is not needed.
        drop(self.resolver.resolve(batch, &self.tag, self.senders.resolved.clone()));
    }

    async fn resolve_unresolved(&self) {
        let batch: Vec<ResolveItem> = self
            .collection
            .lock()
            .await
            .unresolved()
            .iter()
            .map(ResolveItem::from_record)
            .collect();
        self.request_resolution(batch);
    }

    async fn ranked(&self, order: &dyn RankOrder) -> Vec<Record> {
        let mut records = self.collection.lock().await.representatives(order);
        sort_records(&mut records, order);
        records
    }

    /// Pushes the ranked list and redraws the notification when its top
    /// entries changed.
    async fn publish(&self) {
        let (ranked, relevant) = {
            let mut collection = self.collection.lock().await;
            (
                collection.representatives(&DefaultOrder),
                collection.representatives(&self.relevance),
            )
        };
        let mut ranked = ranked;
        sort_records(&mut ranked, &DefaultOrder);
        self.emit(FeedEvent::RankedListChanged(ranked));

        let layout = self.feed.lock().await.update(relevant);
        if let Some(layout) = layout {
            self.emit(FeedEvent::NotificationChanged(layout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_without_discoverers_or_cache() {
        let engine = Engine::builder(EngineSettings::default()).build().unwrap();
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.ranked_list().await.is_empty());
        assert_eq!(engine.phase().await, RevealPhase::Closed);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn restored_cache_keeps_its_epoch_but_reveals_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.sqlite3")).unwrap();
        let epoch_ms = Utc::now().timestamp_millis() - 20_000;
        store
            .save_snapshot(Snapshot::capture(epoch_ms, &[]).unwrap())
            .await
            .unwrap();

        let engine = Engine::builder(EngineSettings::default())
            .cache(store)
            .build()
            .unwrap();
        engine.start().await.unwrap();

        assert_eq!(engine.scan_start_ms(), epoch_ms);
        assert_eq!(engine.phase().await, RevealPhase::Closed);
        let idle = timeout(std::time::Duration::from_millis(200), engine.idle()).await;
        assert!(idle.is_err(), "went idle before the first window");
        assert_eq!(engine.phase().await, RevealPhase::Closed);
        engine.shutdown().await;
    }
}
