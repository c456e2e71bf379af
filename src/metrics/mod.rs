mod types;

pub use types::{MetricsSnapshot, ResolutionSample};

use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::TransportKind;

const MAX_RECENT_RESOLUTIONS: usize = 20;

/// Counters for one engine. Cheap to clone; every clone shares the same state.
///
/// Discoverers report from their own threads, so this uses a blocking lock
/// that is only ever held for a counter bump.
#[derive(Clone, Default)]
pub struct ScanMetrics {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MetricsSnapshot> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_sighting(&self, transport: TransportKind) {
        let mut state = self.state();
        *state.sightings.entry(transport.as_str().to_string()).or_default() += 1;
    }

    /// Malformed or filtered advertisements. Counted, never surfaced.
    pub fn record_decode_failure(&self) {
        self.state().decode_failures += 1;
    }

    /// Sightings reported after the engine stopped listening.
    pub fn record_dropped(&self) {
        self.state().dropped_sightings += 1;
    }

    pub fn record_icon(&self) {
        self.state().icon_count += 1;
    }

    pub fn record_resolution(&self, sample: ResolutionSample) {
        let mut state = self.state();
        match sample.error_status {
            Some(_) => state.resolution_error_count += 1,
            None => {
                state.resolved_count += sample.echoed as u64;
                state.absent_count += sample.absent as u64;
            }
        }
        state.last_resolution_ms = Some(sample.latency_ms);

        state.recent_resolutions.push(sample);
        if state.recent_resolutions.len() > MAX_RECENT_RESOLUTIONS {
            state.recent_resolutions.remove(0);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state().clone()
    }

    pub fn reset(&self) {
        *self.state() = MetricsSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn sample(echoed: usize, absent: usize, error_status: Option<u16>) -> ResolutionSample {
        ResolutionSample {
            timestamp: Utc::now(),
            batch_size: echoed + absent,
            latency_ms: 42,
            echoed,
            absent,
            error_status,
        }
    }

    #[test]
    fn counts_per_transport_and_outcome() {
        let metrics = ScanMetrics::new();
        metrics.record_sighting(TransportKind::Ble);
        metrics.record_sighting(TransportKind::Ble);
        metrics.record_sighting(TransportKind::Ssdp);
        metrics.record_decode_failure();
        metrics.record_resolution(sample(2, 1, None));
        metrics.record_resolution(sample(0, 0, Some(503)));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sightings.get("ble"), Some(&2));
        assert_eq!(snapshot.sighting_count(), 3);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.resolved_count, 2);
        assert_eq!(snapshot.absent_count, 1);
        assert_eq!(snapshot.resolution_error_count, 1);
        assert_eq!(snapshot.last_resolution_ms, Some(42));
    }

    #[test]
    fn keeps_a_bounded_window_of_samples() {
        let metrics = ScanMetrics::new();
        for _ in 0..(MAX_RECENT_RESOLUTIONS + 5) {
            metrics.record_resolution(sample(1, 0, None));
        }
        assert_eq!(metrics.snapshot().recent_resolutions.len(), MAX_RECENT_RESOLUTIONS);

        metrics.reset();
        assert_eq!(metrics.snapshot().resolved_count, 0);
    }
}
