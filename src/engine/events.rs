use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::feed::{FeedLayout, RevealPhase};
use crate::models::{Identity, Record};
use crate::resolve::ResolveItem;

/// Pushed to every subscriber.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    RecordAdded(Record),
    RecordUpdated(Record),
    RankedListChanged(Vec<Record>),
    /// The service had nothing on this URL; show what the transport knows.
    ResolutionAbsent { identity: Identity, url: String },
    /// A whole batch failed. Pass it to `Engine::retry_resolution` to try again.
    ResolutionFailed { batch: Vec<ResolveItem>, status: u16 },
    NotificationChanged(FeedLayout),
    PhaseChanged(RevealPhase),
}

/// Receives feed events until dropped. Each live subscription keeps the
/// engine from going idle.
pub struct Subscription {
    receiver: broadcast::Receiver<FeedEvent>,
    _guard: SubscriberGuard,
}

impl Subscription {
    pub(crate) fn new(receiver: broadcast::Receiver<FeedEvent>, guard: SubscriberGuard) -> Self {
        Self {
            receiver,
            _guard: guard,
        }
    }

    /// Next event, skipping over any the subscriber was too slow to see.
    /// `None` once the engine is gone.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Subscriber lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Counts live subscriptions and reports when the last one goes away.
pub(crate) struct SubscriberGuard {
    count: Arc<AtomicUsize>,
    on_last_drop: Box<dyn Fn() + Send + Sync>,
}

impl SubscriberGuard {
    pub(crate) fn acquire(count: Arc<AtomicUsize>, on_last_drop: Box<dyn Fn() + Send + Sync>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self {
            count,
            on_last_drop,
        }
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            (self.on_last_drop)();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn last_drop_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicBool::new(false));
        let make = || {
            let fired = fired.clone();
            SubscriberGuard::acquire(
                count.clone(),
                Box::new(move || fired.store(true, Ordering::SeqCst)),
            )
        };

        let first = make();
        let second = make();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        drop(first);
        assert!(!fired.load(Ordering::SeqCst));
        drop(second);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
