//! Request draining for graceful shutdown.
//!
//! Processor jobs hold a [`DrainGuard`] while they run. Shutdown flips the
//! controller to `Draining`, waits out the quiesce period, then waits for the
//! in-flight count to reach zero or the cutoff to pass.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Drain lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrainState {
    /// Accepting new requests.
    Active = 0,
    /// Rejecting new requests, waiting for in-flight ones.
    Draining = 1,
    /// Every in-flight request finished.
    Drained = 2,
    /// The cutoff passed with requests still in flight.
    ForceClosed = 3,
}

impl From<u8> for DrainState {
    fn from(value: u8) -> Self {
        match value {
            1 => DrainState::Draining,
            2 => DrainState::Drained,
            3 => DrainState::ForceClosed,
            _ => DrainState::Active,
        }
    }
}

/// Tracks in-flight requests and the drain state.
pub struct DrainController {
    state: AtomicU8,
    inflight_count: AtomicUsize,
    drain_started_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for DrainController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainController")
            .field("state", &self.state())
            .field("inflight", &self.inflight_count())
            .finish()
    }
}

/// Decrements the in-flight count on drop.
pub struct DrainGuard {
    controller: Arc<DrainController>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.controller.inflight_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainController {
    /// Creates an active controller.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(DrainState::Active as u8),
            inflight_count: AtomicUsize::new(0),
            drain_started_at: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> DrainState {
        DrainState::from(self.state.load(Ordering::SeqCst))
    }

    /// Returns true while new requests are admitted.
    pub fn is_accepting(&self) -> bool {
        self.state() == DrainState::Active
    }

    /// Admits one request, or returns `None` once draining has begun.
    pub fn try_acquire(self: &Arc<Self>) -> Option<DrainGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.inflight_count.fetch_add(1, Ordering::SeqCst);
        // begin_drain may have raced in between; the guard still counts.
        Some(DrainGuard {
            controller: Arc::clone(self),
        })
    }

    /// In-flight requests.
    pub fn inflight_count(&self) -> usize {
        self.inflight_count.load(Ordering::SeqCst)
    }

    /// Transitions Active to Draining. Returns false if already past Active.
    pub fn begin_drain(&self) -> bool {
        let started = self
            .state
            .compare_exchange(
                DrainState::Active as u8,
                DrainState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if started {
            *self.drain_started_at.lock() = Some(Instant::now());
            info!(inflight = self.inflight_count(), "drain started");
        }
        started
    }

    /// Moves Draining to Drained once nothing is in flight.
    pub fn check_drained(&self) -> bool {
        match self.state() {
            DrainState::Drained => true,
            DrainState::Draining if self.inflight_count() == 0 => {
                let moved = self
                    .state
                    .compare_exchange(
                        DrainState::Draining as u8,
                        DrainState::Drained as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if moved {
                    info!(elapsed = ?self.elapsed_since_drain(), "drain completed");
                }
                true
            }
            _ => false,
        }
    }

    /// Gives up on in-flight requests.
    pub fn force_close(&self) {
        let old = self.state.swap(DrainState::ForceClosed as u8, Ordering::SeqCst);
        if old != DrainState::ForceClosed as u8 {
            warn!(
                from = ?DrainState::from(old),
                inflight = self.inflight_count(),
                "drain cutoff reached, force closing"
            );
        }
    }

    /// Time since `begin_drain`, if draining has begun.
    pub fn elapsed_since_drain(&self) -> Option<Duration> {
        self.drain_started_at.lock().map(|start| start.elapsed())
    }

    /// Waits `quiesce`, then polls until drained or `cutoff` (measured from
    /// the call) passes. Begins the drain if it has not begun yet.
    pub async fn wait_drained(&self, quiesce: Duration, cutoff: Duration) -> DrainState {
        self.begin_drain();
        let deadline = tokio::time::Instant::now() + cutoff.max(quiesce);
        tokio::time::sleep(quiesce).await;

        loop {
            if self.check_drained() {
                return DrainState::Drained;
            }
            if tokio::time::Instant::now() >= deadline {
                self.force_close();
                return DrainState::ForceClosed;
            }
            debug!(inflight = self.inflight_count(), "waiting for in-flight requests");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_active() {
        let controller = DrainController::new();
        assert_eq!(controller.state(), DrainState::Active);
        assert!(controller.is_accepting());
    }

    #[test]
    fn test_guard_tracks_inflight() {
        let controller = Arc::new(DrainController::new());
        let guard = controller.try_acquire().unwrap();
        assert_eq!(controller.inflight_count(), 1);
        drop(guard);
        assert_eq!(controller.inflight_count(), 0);
    }

    #[test]
    fn test_begin_drain_rejects_new_requests() {
        let controller = Arc::new(DrainController::new());
        assert!(controller.begin_drain());
        assert!(!controller.begin_drain());
        assert!(controller.try_acquire().is_none());
    }

    #[test]
    fn test_check_drained_waits_for_guards() {
        let controller = Arc::new(DrainController::new());
        let guard = controller.try_acquire().unwrap();
        controller.begin_drain();
        assert!(!controller.check_drained());
        drop(guard);
        assert!(controller.check_drained());
        assert_eq!(controller.state(), DrainState::Drained);
    }

    #[test]
    fn test_check_drained_when_active_is_false() {
        let controller = DrainController::new();
        assert!(!controller.check_drained());
    }

    #[tokio::test]
    async fn test_wait_drained_completes_when_idle() {
        let controller = DrainController::new();
        let state = controller
            .wait_drained(Duration::from_millis(10), Duration::from_millis(500))
            .await;
        assert_eq!(state, DrainState::Drained);
        assert!(controller.elapsed_since_drain().is_some());
    }

    #[tokio::test]
    async fn test_wait_drained_forces_close_at_cutoff() {
        let controller = Arc::new(DrainController::new());
        let _guard = controller.try_acquire().unwrap();
        let state = controller
            .wait_drained(Duration::from_millis(5), Duration::from_millis(50))
            .await;
        assert_eq!(state, DrainState::ForceClosed);
    }

    #[tokio::test]
    async fn test_wait_drained_sees_late_completion() {
        let controller = Arc::new(DrainController::new());
        let guard = controller.try_acquire().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        let state = controller
            .wait_drained(Duration::from_millis(5), Duration::from_secs(2))
            .await;
        assert_eq!(state, DrainState::Drained);
    }
}
