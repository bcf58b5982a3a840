//! Learns the remote theme's checksums on an interval and hands changes to
//! the reconciler.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::checksum::{diff_snapshots, Checksum, ChecksumDelta};
use crate::reconciler::Reconciler;
use crate::theme_api::{ApiError, ThemeApi};

/// Backoff ceiling for repeated poll failures.
pub const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);

/// When the next poll happens, derived from how the previous ones went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollState {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
}

impl PollState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_backoff: MAX_POLL_BACKOFF.max(interval),
            last_success: None,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        self.last_success = Some(now);
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// `interval * 2^failures`, capped at `max_backoff`.
    pub fn next_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.consecutive_failures.min(16));
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Read-only view of the latest remote snapshot.
#[derive(Clone, Default)]
pub struct SnapshotView {
    inner: Arc<RwLock<Option<Arc<Vec<Checksum>>>>>,
}

impl SnapshotView {
    pub fn get(&self) -> Option<Arc<Vec<Checksum>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn replace(&self, snapshot: Arc<Vec<Checksum>>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }
}

pub struct RemoteChecksumPoller {
    api: Arc<dyn ThemeApi>,
    theme_id: u64,
    state: PollState,
    snapshot: SnapshotView,
}

impl RemoteChecksumPoller {
    pub fn new(api: Arc<dyn ThemeApi>, theme_id: u64, interval: Duration) -> Self {
        Self {
            api,
            theme_id,
            state: PollState::new(interval),
            snapshot: SnapshotView::default(),
        }
    }

    /// Starts from a snapshot fetched elsewhere, e.g. during startup.
    pub fn with_initial_snapshot(self, snapshot: Vec<Checksum>) -> Self {
        self.snapshot.replace(Arc::new(snapshot));
        self
    }

    pub fn snapshot(&self) -> SnapshotView {
        self.snapshot.clone()
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Fetches once. Returns the new snapshot and its delta when something
    /// changed. A failed fetch leaves the stored snapshot untouched.
    pub async fn poll_once(
        &mut self,
    ) -> Result<Option<(Arc<Vec<Checksum>>, ChecksumDelta)>, ApiError> {
        let fetched = match self.api.fetch_checksums(self.theme_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.state.record_failure();
                return Err(err);
            }
        };
        self.state.record_success(Instant::now());

        let previous = self.snapshot.get();
        let delta = match &previous {
            Some(previous) => diff_snapshots(previous, &fetched),
            None => diff_snapshots(&[], &fetched),
        };

        if previous.is_some() && delta.is_empty() {
            return Ok(None);
        }

        let fetched = Arc::new(fetched);
        self.snapshot.replace(Arc::clone(&fetched));
        Ok(Some((fetched, delta)))
    }

    /// Polls until `cancel` fires, handing every changed snapshot to the
    /// reconciler in poll order. Reconciliation runs on its own task so a slow
    /// pass never delays the next tick.
    pub async fn run(mut self, reconciler: Arc<Reconciler>, cancel: CancellationToken) {
        loop {
            let delay = self.state.next_delay();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => result,
            };

            match result {
                Ok(Some((snapshot, delta))) => {
                    log::info!(
                        "Remote theme changed: {} added, {} changed, {} removed",
                        delta.added.len(),
                        delta.changed.len(),
                        delta.removed.len()
                    );

                    reconciler.enqueue(snapshot);
                }
                Ok(None) => {
                    log::trace!("Remote theme unchanged");
                    reconciler.retry_uploads();
                }
                Err(err) => log::warn!(
                    "Could not fetch remote checksums ({} failure(s) in a row), retrying in {}: {}",
                    self.state.consecutive_failures,
                    humantime::format_duration(self.state.next_delay()),
                    err
                ),
            }
        }

        log::debug!("Remote poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_failure_and_caps() {
        let mut state = PollState::new(Duration::from_secs(3));
        assert_eq!(state.next_delay(), Duration::from_secs(3));

        state.record_failure();
        assert_eq!(state.next_delay(), Duration::from_secs(6));

        state.record_failure();
        assert_eq!(state.next_delay(), Duration::from_secs(12));

        for _ in 0..10 {
            state.record_failure();
        }
        assert_eq!(state.next_delay(), MAX_POLL_BACKOFF);
    }

    #[test]
    fn success_resets_failures() {
        let mut state = PollState::new(Duration::from_secs(1));
        state.record_failure();
        state.record_failure();

        let now = Instant::now();
        state.record_success(now);

        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_success, Some(now));
        assert_eq!(state.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let mut state = PollState::new(Duration::from_secs(5));
        state.consecutive_failures = u32::MAX;
        assert_eq!(state.next_delay(), MAX_POLL_BACKOFF);
    }
}
