//! Remoting counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`RemotingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Two-way and callback requests written.
    pub requests_sent: u64,
    /// One-way requests written.
    pub oneway_sent: u64,
    /// Requests received from peers.
    pub requests_received: u64,
    /// Responses written to peers.
    pub responses_sent: u64,
    /// Responses matched to a pending call.
    pub responses_received: u64,
    /// Responses with no pending call (late or unknown).
    pub responses_discarded: u64,
    /// Pending calls completed by the expiry sweep or a sync deadline.
    pub timeouts: u64,
    /// Pending calls cancelled because their channel closed.
    pub cancelled: u64,
    /// Requests that could not be written.
    pub send_failures: u64,
    /// Requests refused for lack of permits or scheduler capacity.
    pub busy_rejections: u64,
    /// Requests answered with `REQUEST_CODE_NOT_SUPPORTED`.
    pub unsupported_codes: u64,
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Connections currently open.
    pub active_connections: u64,
    /// Idle events raised.
    pub idle_events: u64,
}

/// Lock-free counters shared by the engine and the connection manager.
#[derive(Default)]
pub struct RemotingMetrics {
    requests_sent: AtomicU64,
    oneway_sent: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    responses_received: AtomicU64,
    responses_discarded: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    send_failures: AtomicU64,
    busy_rejections: AtomicU64,
    unsupported_codes: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU64,
    idle_events: AtomicU64,
}

impl std::fmt::Debug for RemotingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl RemotingMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_oneway_sent(&self) {
        self.oneway_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_requests_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_responses_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_responses_discarded(&self) {
        self.responses_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_cancelled(&self, n: u64) {
        self.cancelled.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_busy_rejections(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_unsupported_codes(&self) {
        self.unsupported_codes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_idle_events(&self) {
        self.idle_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a new connection.
    pub(crate) fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a closed connection.
    pub(crate) fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            oneway_sent: self.oneway_sent.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            responses_discarded: self.responses_discarded.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            unsupported_codes: self.unsupported_codes.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            idle_events: self.idle_events.load(Ordering::Relaxed),
        }
    }
}
