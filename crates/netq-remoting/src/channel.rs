//! Channel handle and the per-connection I/O driver.
//!
//! Each connection gets a reader task and a writer task. The reader pushes
//! frames through the pipeline in arrival order; the writer drains an
//! unbounded queue so outbound order is the order of `write` calls.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ChannelEvent;
use crate::error::{RemotingError, Result};
use crate::pipeline::{Message, Pipeline};
use crate::protocol::{frame_codec, frame_codec_with_limit, Command};

/// Process-unique channel identifier.
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on flushing queued frames once a channel closes.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);

type WriteCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

enum WriteAck {
    None,
    Notify(oneshot::Sender<Result<()>>),
    Callback(WriteCallback),
}

impl WriteAck {
    fn complete(self, result: Result<()>) {
        match self {
            WriteAck::None => {}
            WriteAck::Notify(tx) => {
                let _ = tx.send(result);
            }
            WriteAck::Callback(callback) => callback(result),
        }
    }
}

struct Outbound {
    frame: Bytes,
    ack: WriteAck,
}

struct ChannelInner {
    id: ChannelId,
    peer_addr: String,
    local_addr: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    pipeline: Arc<Pipeline>,
    token: CancellationToken,
    epoch: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    last_idle_ms: AtomicU64,
}

/// Cheaply cloneable handle to one connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Channel {
    /// Channel identifier.
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Remote address.
    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    /// Local address.
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Returns false once the channel has been closed by either side.
    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    /// Closes the channel.
    ///
    /// Frames already queued are flushed for a short grace period; writes
    /// attempted afterwards fail with `ChannelClosed`.
    pub fn close(&self) {
        self.inner.token.cancel();
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }

    /// Encodes `command` and queues it for writing.
    ///
    /// The returned receiver resolves when the frame has been flushed to the
    /// socket or the write has failed. Callable from any thread.
    pub fn write(&self, command: Command) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(command, WriteAck::Notify(tx))?;
        Ok(rx)
    }

    /// Queues `command` without waiting for the write to complete.
    pub fn write_and_forget(&self, command: Command) -> Result<()> {
        self.enqueue(command, WriteAck::None)
    }

    /// Queues `command`; `on_written` runs on the writer task once the frame
    /// is flushed or has failed. When this returns an error `on_written` is
    /// dropped without being called.
    pub(crate) fn write_with<F>(&self, command: Command, on_written: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(command, WriteAck::Callback(Box::new(on_written)))
    }

    /// Writes `command` and waits for the flush.
    pub async fn send(&self, command: Command) -> Result<()> {
        let ack = self.write(command)?;
        ack.await
            .unwrap_or_else(|_| Err(RemotingError::ChannelClosed(self.inner.peer_addr.clone())))
    }

    fn enqueue(&self, command: Command, ack: WriteAck) -> Result<()> {
        if !self.is_active() {
            return Err(RemotingError::ChannelClosed(self.inner.peer_addr.clone()));
        }
        let frame = self.inner.pipeline.encode_outbound(self, command)?;
        self.inner
            .outbound
            .send(Outbound { frame, ack })
            .map_err(|_| RemotingError::ChannelClosed(self.inner.peer_addr.clone()))
    }

    /// Time since the last read or write.
    pub fn idle_for(&self) -> Duration {
        let now = self.now_ms();
        let last = self
            .inner
            .last_read_ms
            .load(Ordering::Relaxed)
            .max(self.inner.last_write_ms.load(Ordering::Relaxed));
        Duration::from_millis(now.saturating_sub(last))
    }

    pub(crate) fn touch_read(&self) {
        self.inner.last_read_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn touch_write(&self) {
        self.inner.last_write_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    // True at most once per `all_idle` of silence.
    fn poll_idle(&self, all_idle: Duration) -> bool {
        let now = self.now_ms();
        let last = self
            .inner
            .last_read_ms
            .load(Ordering::Relaxed)
            .max(self.inner.last_write_ms.load(Ordering::Relaxed))
            .max(self.inner.last_idle_ms.load(Ordering::Relaxed));
        if now.saturating_sub(last) >= all_idle.as_millis() as u64 {
            self.inner.last_idle_ms.store(now, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }
}

/// Channel accepting frames up to `i32::MAX`.
#[cfg(test)]
pub(crate) fn spawn_channel<S>(
    stream: S,
    peer_addr: String,
    local_addr: String,
    pipeline: Arc<Pipeline>,
    parent: &CancellationToken,
    all_idle: Option<Duration>,
) -> Channel
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_frame_length = crate::protocol::MAX_FRAME_LENGTH;
    spawn_channel_limited(stream, peer_addr, local_addr, pipeline, parent, all_idle, max_frame_length)
}

/// Starts the reader and writer tasks for an established stream.
///
/// TLS, when enabled, has already been negotiated on `stream`. The channel is
/// closed when `parent` is cancelled. `all_idle` of `None` disables idle events.
/// Inbound frames longer than `max_frame_length` close the channel; outbound
/// frames are not limited.
pub(crate) fn spawn_channel_limited<S>(
    stream: S,
    peer_addr: String,
    local_addr: String,
    pipeline: Arc<Pipeline>,
    parent: &CancellationToken,
    all_idle: Option<Duration>,
    max_frame_length: usize,
) -> Channel
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let channel = Channel {
        inner: Arc::new(ChannelInner {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            outbound: tx,
            pipeline,
            token: parent.child_token(),
            epoch: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            last_idle_ms: AtomicU64::new(0),
        }),
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let frames = FramedRead::new(read_half, frame_codec_with_limit(max_frame_length));
    let sink = FramedWrite::new(write_half, frame_codec());

    channel.pipeline().fire_event(&channel, ChannelEvent::Connect);
    tokio::spawn(write_loop(channel.clone(), sink, rx));
    tokio::spawn(read_loop(channel.clone(), frames, all_idle));
    channel
}

async fn read_loop<R>(channel: Channel, mut frames: R, all_idle: Option<Duration>)
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let token = channel.inner.token.clone();
    let pipeline = Arc::clone(channel.pipeline());
    let period = all_idle
        .map(|idle| (idle / 4).max(Duration::from_millis(10)))
        .unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    if let Err(e) = pipeline.fire_inbound(&channel, Message::Frame(frame.freeze())) {
                        pipeline.fire_event(&channel, ChannelEvent::Exception(e.to_string()));
                        break;
                    }
                }
                Some(Err(e)) => {
                    let err = if e.kind() == io::ErrorKind::InvalidData {
                        RemotingError::ProtocolDecode { reason: e.to_string() }
                    } else {
                        RemotingError::Io(e)
                    };
                    pipeline.fire_event(&channel, ChannelEvent::Exception(err.to_string()));
                    break;
                }
                None => {
                    debug!(channel = channel.id(), peer = channel.peer_addr(), "peer closed connection");
                    break;
                }
            },
            _ = ticker.tick(), if all_idle.is_some() => {
                if all_idle.is_some_and(|idle| channel.poll_idle(idle)) {
                    pipeline.fire_event(&channel, ChannelEvent::Idle);
                }
            }
        }
    }

    channel.close();
    pipeline.fire_event(&channel, ChannelEvent::Close);
}

async fn write_loop<W>(channel: Channel, mut sink: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    let token = channel.inner.token.clone();
    let mut healthy = true;
    while healthy {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(out) = next else { break };

        let result = tokio::select! {
            biased;
            res = sink.send(out.frame) => res.map_err(|e| RemotingError::SendFailure {
                addr: channel.peer_addr().to_string(),
                reason: e.to_string(),
            }),
            _ = token.cancelled() => Err(RemotingError::ChannelClosed(channel.peer_addr().to_string())),
        };
        match &result {
            Ok(()) => channel.touch_write(),
            Err(e) => {
                warn!(channel = channel.id(), peer = channel.peer_addr(), error = %e, "write failed, closing channel");
                healthy = false;
                channel.close();
            }
        }
        out.ack.complete(result);
    }

    // frames queued before the close get a bounded chance to go out
    rx.close();
    if healthy {
        let deadline = tokio::time::Instant::now() + CLOSE_FLUSH_TIMEOUT;
        while let Ok(out) = rx.try_recv() {
            match tokio::time::timeout_at(deadline, sink.send(out.frame)).await {
                Ok(Ok(())) => out.ack.complete(Ok(())),
                Ok(Err(e)) => {
                    out.ack.complete(Err(RemotingError::SendFailure {
                        addr: channel.peer_addr().to_string(),
                        reason: e.to_string(),
                    }));
                    break;
                }
                Err(_) => {
                    out.ack
                        .complete(Err(RemotingError::ChannelClosed(channel.peer_addr().to_string())));
                    break;
                }
            }
        }
    }
    while let Ok(out) = rx.try_recv() {
        out.ack
            .complete(Err(RemotingError::ChannelClosed(channel.peer_addr().to_string())));
    }
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
}
