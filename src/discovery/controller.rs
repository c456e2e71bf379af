use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::DiscovererState;

struct ControllerInner {
    state: DiscovererState,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

/// Start/stop bookkeeping shared by every discoverer: the state machine,
/// the scan task handle and its cancellation token.
pub struct ScanController {
    name: &'static str,
    inner: Mutex<ControllerInner>,
}

impl ScanController {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(ControllerInner {
                state: DiscovererState::Stopped,
                handle: None,
                cancel_token: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> DiscovererState {
        self.lock().state
    }

    /// Moves to `Starting` and hands out the token for the new scan, or
    /// returns `None` when a scan is already starting or running.
    pub fn begin_start(&self) -> Option<CancellationToken> {
        let mut inner = self.lock();
        if inner.state != DiscovererState::Stopped {
            return None;
        }
        let token = CancellationToken::new();
        inner.state = DiscovererState::Starting;
        inner.cancel_token = Some(token.clone());
        Some(token)
    }

    /// Records the scan task for the start that was handed `token`.
    ///
    /// A `stop` that landed while starting cancels `token`. The task is then
    /// handed back in `Err`, the state stays `Stopped`, and the caller has to
    /// undo whatever it started on the platform side.
    pub fn mark_running(
        &self,
        token: &CancellationToken,
        handle: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut inner = self.lock();
        if token.is_cancelled() || inner.state != DiscovererState::Starting {
            info!("{} scan stopped before it started", self.name);
            return Err(handle);
        }
        inner.handle = Some(handle);
        inner.state = DiscovererState::Running;
        info!("{} scan running", self.name);
        Ok(())
    }

    /// Undoes `begin_start` after the platform refused to scan.
    pub fn abort_start(&self) {
        let mut inner = self.lock();
        inner.cancel_token = None;
        inner.handle = None;
        inner.state = DiscovererState::Stopped;
    }

    /// Cancels the scan task and waits up to `timeout` for it to finish.
    /// Returns whether a scan was actually running.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let (token, handle) = {
            let mut inner = self.lock();
            match inner.state {
                DiscovererState::Stopped | DiscovererState::Stopping => return false,
                DiscovererState::Starting | DiscovererState::Running => {}
            }
            inner.state = DiscovererState::Stopping;
            (inner.cancel_token.take(), inner.handle.take())
        };

        if let Some(token) = token {
            token.cancel();
        }

        if let Some(mut handle) = handle {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("{} scan task failed to join: {err}", self.name),
                Err(_) => {
                    warn!("{} scan task did not stop within {:?}, aborting", self.name, timeout);
                    handle.abort();
                }
            }
        }

        self.lock().state = DiscovererState::Stopped;
        info!("{} scan stopped", self.name);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let controller = ScanController::new("test");
        assert!(!controller.stop(Duration::from_millis(50)).await);

        let token = controller.begin_start().unwrap();
        assert!(controller.begin_start().is_none());
        assert_eq!(controller.state(), DiscovererState::Starting);

        let task_token = token.clone();
        controller
            .mark_running(
                &token,
                tokio::spawn(async move {
                    task_token.cancelled().await;
                }),
            )
            .unwrap();
        assert_eq!(controller.state(), DiscovererState::Running);

        assert!(controller.stop(Duration::from_secs(1)).await);
        assert!(token.is_cancelled());
        assert_eq!(controller.state(), DiscovererState::Stopped);
        assert!(!controller.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn stuck_tasks_are_aborted() {
        let controller = ScanController::new("stuck");
        let token = controller.begin_start().unwrap();
        controller
            .mark_running(&token, tokio::spawn(std::future::pending::<()>()))
            .unwrap();

        assert!(controller.stop(Duration::from_millis(20)).await);
        assert_eq!(controller.state(), DiscovererState::Stopped);
    }

    #[tokio::test]
    async fn stop_during_start_wins() {
        let controller = ScanController::new("racing");
        let stale = controller.begin_start().unwrap();
        assert!(controller.stop(Duration::from_millis(50)).await);
        assert!(stale.is_cancelled());

        // A new start began before the first one finished.
        let fresh = controller.begin_start().unwrap();
        let rejected = controller.mark_running(&stale, tokio::spawn(std::future::pending::<()>()));
        let handle = rejected.unwrap_err();
        handle.abort();
        assert_eq!(controller.state(), DiscovererState::Starting);

        controller.abort_start();
        assert!(controller.mark_running(&fresh, tokio::spawn(async {})).is_err());
        assert_eq!(controller.state(), DiscovererState::Stopped);
    }

    #[test]
    fn aborted_start_returns_to_stopped() {
        let controller = ScanController::new("radio");
        controller.begin_start().unwrap();
        controller.abort_start();
        assert_eq!(controller.state(), DiscovererState::Stopped);
        assert!(controller.begin_start().is_some());
    }
}
