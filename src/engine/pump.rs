use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::{lock, FeedEvent, Shared};
use crate::feed::RevealPhase;
use crate::models::Sighting;
use crate::resolve::{IconEvent, ResolveEvent, ResolveItem};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Upper bound on sightings folded in under one lock.
const MAX_SIGHTING_BATCH: usize = 64;

pub(super) enum Control {
    /// The scan clock moved; recompute the reveal deadline.
    Reschedule,
}

pub(super) struct Receivers {
    pub(super) sightings: mpsc::UnboundedReceiver<Sighting>,
    pub(super) resolved: mpsc::UnboundedReceiver<ResolveEvent>,
    pub(super) icons: mpsc::UnboundedReceiver<IconEvent>,
    pub(super) control: mpsc::UnboundedReceiver<Control>,
}

/// The single writer. Every change to the collection comes through here.
pub(super) async fn run(shared: Arc<Shared>, mut rx: Receivers, cancel_token: CancellationToken) {
    loop {
        let deadline = shared.next_reveal().await;

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("event pump shutting down");
                break;
            }
            Some(Control::Reschedule) = rx.control.recv() => {}
            Some(first) = rx.sightings.recv() => {
                let mut batch = vec![first];
                while batch.len() < MAX_SIGHTING_BATCH {
                    match rx.sightings.try_recv() {
                        Ok(sighting) => batch.push(sighting),
                        Err(_) => break,
                    }
                }
                shared.ingest(batch).await;
            }
            Some(event) = rx.resolved.recv() => shared.on_resolved(event).await,
            Some(event) = rx.icons.recv() => shared.on_icon(event).await,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                shared.advance_reveal().await;
            }
        }
    }

    // Hand the channels back so a later start can run the pump again.
    *lock(&shared.receivers) = Some(rx);
}

impl Shared {
    async fn next_reveal(&self) -> Option<Instant> {
        let start = self.scan_start().instant;
        let windows = self.settings.reveal_windows();
        match self.feed.lock().await.phase() {
            RevealPhase::Closed => Some(start + windows.first),
            RevealPhase::Open => Some(start + windows.second),
            RevealPhase::Settled => None,
        }
    }

    async fn advance_reveal(&self) {
        let elapsed = self.scan_start().instant.elapsed();
        let phase = RevealPhase::at(elapsed, self.settings.reveal_windows());

        let relevant = self.collection.lock().await.representatives(&self.relevance);
        let (changed, layout) = {
            let mut feed = self.feed.lock().await;
            if feed.phase() == phase {
                (false, None)
            } else {
                (true, feed.advance(phase, relevant))
            }
        };
        if !changed {
            return;
        }

        log_debug!("Feed phase now {phase:?} after {}ms", elapsed.as_millis());
        self.emit(FeedEvent::PhaseChanged(phase));
        if let Some(layout) = layout {
            self.emit(FeedEvent::NotificationChanged(layout));
        }
        if phase == RevealPhase::Settled {
            self.settled.store(true, std::sync::atomic::Ordering::SeqCst);
            self.refresh_idle();
        }
    }

    async fn ingest(&self, batch: Vec<Sighting>) {
        let mut to_resolve = Vec::new();
        let mut notices = Vec::with_capacity(batch.len());
        let mut listed_changed = false;

        {
            let mut collection = self.collection.lock().await;
            for sighting in batch {
                let update = collection.add_sighting(sighting);
                if update.needs_resolution {
                    to_resolve.push(ResolveItem::from_record(&update.record));
                }
                // Listed records may move with distance; a re-resolving one drops out.
                listed_changed |= update.record.metadata().is_some()
                    || (update.needs_resolution && !update.is_new);
                if update.is_new {
                    notices.push(FeedEvent::RecordAdded(update.record));
                } else {
                    notices.push(FeedEvent::RecordUpdated(update.record));
                }
            }
        }

        for notice in notices {
            self.emit(notice);
        }
        self.request_resolution(to_resolve);
        if listed_changed {
            self.publish().await;
        }
    }

    async fn on_resolved(&self, event: ResolveEvent) {
        match event {
            ResolveEvent::Metadata { identity, metadata } => {
                let icon_url = metadata.icon_url.clone();
                let Some(record) = self.collection.lock().await.apply_metadata(&identity, metadata) else {
                    log_debug!("Dropping metadata for {identity}: record is gone or moved to another url");
                    return;
                };
                let needs_icon = record.metadata().is_some_and(|meta| meta.icon.is_none());
                self.emit(FeedEvent::RecordUpdated(record));

                if let (true, Some(icon_url)) = (needs_icon, icon_url) {
                    self.icons
                        .ensure_icon(&icon_url, self.network_token(), self.senders.icons.clone())
                        .await;
                }
                self.publish().await;
            }
            ResolveEvent::Absent { identity, url } => {
                let current = self.collection.lock().await.get(&identity).map(|record| record.url() == url);
                if current != Some(true) {
                    return;
                }
                log_debug!("No metadata for {url}");
                self.emit(FeedEvent::ResolutionAbsent { identity, url });
            }
            ResolveEvent::Error { batch, error } => {
                log_warn!("Resolution failed for {} urls: {error}", batch.len());
                self.emit(FeedEvent::ResolutionFailed {
                    batch,
                    status: error.status_code(),
                });
            }
        }
    }

    async fn on_icon(&self, event: IconEvent) {
        match event {
            IconEvent::Fetched { icon_url, bytes } => {
                let updated = self.collection.lock().await.apply_icon(&icon_url, &bytes);
                if updated.is_empty() {
                    return;
                }
                for record in updated {
                    self.emit(FeedEvent::RecordUpdated(record));
                }
                self.publish().await;
            }
            IconEvent::Failed { icon_url, reason } => {
                log_debug!("No icon from {icon_url}: {reason}");
            }
        }
    }
}
