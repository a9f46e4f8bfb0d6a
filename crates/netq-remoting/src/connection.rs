//! Connection registry and lifecycle notification.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelId};
use crate::config::IdlePolicy;
use crate::metrics::RemotingMetrics;
use crate::pipeline::Stage;
use crate::scheduler::panic_message;

/// Events queued beyond this are dropped.
pub const MAX_PENDING_EVENTS: usize = 10_000;

/// Channel lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel became active.
    Connect,
    /// The channel closed.
    Close,
    /// Neither reads nor writes happened for the all-idle interval.
    Idle,
    /// The channel failed; the reason is the error text.
    Exception(String),
}

/// Application callbacks for channel lifecycle events.
///
/// Called on the notifier thread, one event at a time, in the order events
/// were raised.
pub trait ChannelEventListener: Send + Sync + 'static {
    /// A channel connected.
    fn on_connect(&self, _channel: &Channel) {}
    /// A channel closed.
    fn on_close(&self, _channel: &Channel) {}
    /// A channel went all-idle.
    fn on_idle(&self, _channel: &Channel) {}
    /// A channel failed.
    fn on_exception(&self, _channel: &Channel, _reason: &str) {}
}

type QueuedEvent = (Channel, ChannelEvent);

/// Delivers lifecycle events to a listener on a dedicated thread.
pub struct LifecycleNotifier {
    listener: Option<Arc<dyn ChannelEventListener>>,
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedEvent>>>,
    pending: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleNotifier {
    /// Creates a notifier; without a listener every event is dropped.
    pub fn new(listener: Option<Arc<dyn ChannelEventListener>>) -> Self {
        Self {
            listener,
            tx: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
            handle: Mutex::new(None),
        }
    }

    /// Starts the notifier thread. No-op without a listener or if running.
    pub fn start(&self) -> std::io::Result<()> {
        let Some(listener) = self.listener.clone() else {
            return Ok(());
        };
        let mut tx_slot = self.tx.lock();
        if tx_slot.is_some() {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedEvent>();
        let pending = Arc::clone(&self.pending);
        let handle = std::thread::Builder::new()
            .name("netq-event".to_string())
            .spawn(move || {
                while let Some((channel, event)) = rx.blocking_recv() {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &event {
                        ChannelEvent::Connect => listener.on_connect(&channel),
                        ChannelEvent::Close => listener.on_close(&channel),
                        ChannelEvent::Idle => listener.on_idle(&channel),
                        ChannelEvent::Exception(reason) => listener.on_exception(&channel, reason),
                    }));
                    if let Err(panic) = outcome {
                        error!(
                            channel = channel.id(),
                            event = ?event,
                            panic = %panic_message(panic.as_ref()),
                            "channel event listener panicked"
                        );
                    }
                }
                debug!("event notifier stopped");
            })?;
        *tx_slot = Some(tx);
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Queues an event. Dropped with a warning when the queue is full.
    pub fn notify(&self, channel: &Channel, event: ChannelEvent) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else { return };
        if self.pending.fetch_add(1, Ordering::SeqCst) >= MAX_PENDING_EVENTS {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(channel = channel.id(), event = ?event, "event queue full, dropping event");
            return;
        }
        if tx.send((channel.clone(), event)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Events queued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops accepting events, delivers the queued ones and joins the thread.
    ///
    /// Blocks; call from a blocking context.
    pub fn stop(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("event notifier thread panicked");
            }
        }
    }
}

/// Tracks live channels and reacts to lifecycle events.
pub struct ConnectionManager {
    channels: DashMap<ChannelId, Channel>,
    notifier: Arc<LifecycleNotifier>,
    idle_policy: IdlePolicy,
    metrics: Arc<RemotingMetrics>,
}

impl ConnectionManager {
    /// Creates a manager reporting to `notifier`.
    pub fn new(
        notifier: Arc<LifecycleNotifier>,
        idle_policy: IdlePolicy,
        metrics: Arc<RemotingMetrics>,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            notifier,
            idle_policy,
            metrics,
        }
    }

    /// Live channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    /// Looks up a live channel.
    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.channels.get(&id).map(|e| e.value().clone())
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true when no channel is live.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Stage for ConnectionManager {
    fn name(&self) -> &'static str {
        "connections"
    }

    fn event(&self, channel: &Channel, event: &ChannelEvent) {
        match event {
            ChannelEvent::Connect => {
                self.channels.insert(channel.id(), channel.clone());
                self.metrics.connection_opened();
                info!(channel = channel.id(), peer = channel.peer_addr(), "channel connected");
            }
            ChannelEvent::Close => {
                if self.channels.remove(&channel.id()).is_some() {
                    self.metrics.connection_closed();
                }
                info!(channel = channel.id(), peer = channel.peer_addr(), "channel closed");
            }
            ChannelEvent::Idle => {
                self.metrics.inc_idle_events();
                match self.idle_policy {
                    IdlePolicy::Log => {
                        info!(channel = channel.id(), peer = channel.peer_addr(), "channel idle")
                    }
                    IdlePolicy::Close => {
                        info!(channel = channel.id(), peer = channel.peer_addr(), "closing idle channel");
                        channel.close();
                    }
                }
            }
            ChannelEvent::Exception(reason) => {
                warn!(channel = channel.id(), peer = channel.peer_addr(), reason = %reason, "channel exception, closing");
                channel.close();
            }
        }
        self.notifier.notify(channel, event.clone());
    }
}
