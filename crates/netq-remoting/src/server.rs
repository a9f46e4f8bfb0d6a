//! Remoting server: accept loop, per-connection setup and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{spawn_channel_limited, Channel};
use crate::config::{build_io_runtime, ServerConfig};
use crate::connection::{ChannelEventListener, ConnectionManager, LifecycleNotifier};
use crate::error::{RemotingError, Result};
use crate::invoke::InvocationEngine;
use crate::metrics::{MetricsSnapshot, RemotingMetrics};
use crate::pipeline::{Pipeline, Stage};
use crate::processor::{Processor, ProcessorEntry, RpcHook};
use crate::protocol::Command;
use crate::scheduler::ElasticScheduler;
use crate::tls::TlsAcceptor;

/// Accepts connections and serves requests with registered processors.
///
/// Can also call back into connected clients over their channels.
///
/// With a non-zero `io_threads` the listener and every channel run on a
/// dedicated multi-threaded runtime of that size; with zero they run on the
/// runtime `start` is called from.
pub struct RemotingServer {
    config: ServerConfig,
    engine: Arc<InvocationEngine>,
    connections: Arc<ConnectionManager>,
    notifier: Arc<LifecycleNotifier>,
    pipeline: Arc<Pipeline>,
    tls: Option<TlsAcceptor>,
    local_addr: Mutex<Option<SocketAddr>>,
    io_runtime: Mutex<Option<Runtime>>,
    shutdown: CancellationToken,
    channels_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemotingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingServer")
            .field("listen_addr", &self.config.listen_addr)
            .field("local_addr", &*self.local_addr.lock())
            .field("channels", &self.connections.len())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl RemotingServer {
    /// Creates a server without a lifecycle listener.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates a server reporting channel events to `listener`.
    pub fn with_listener(config: ServerConfig, listener: Arc<dyn ChannelEventListener>) -> Result<Self> {
        Self::build(config, Some(listener))
    }

    fn build(config: ServerConfig, listener: Option<Arc<dyn ChannelEventListener>>) -> Result<Self> {
        let tls = config.tls.as_ref().map(TlsAcceptor::new).transpose()?;
        let metrics = Arc::new(RemotingMetrics::new());
        let scheduler = Arc::new(ElasticScheduler::new(config.callback_scheduler()));
        let engine = Arc::new(InvocationEngine::new(
            config.permits_async,
            config.permits_oneway,
            scheduler,
            Arc::clone(&metrics),
        ));
        let notifier = Arc::new(LifecycleNotifier::new(listener));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&notifier),
            config.idle_policy,
            metrics,
        ));
        let pipeline = Arc::new(Pipeline::standard(
            Arc::clone(&connections) as Arc<dyn Stage>,
            Arc::clone(&engine),
        ));

        Ok(Self {
            config,
            engine,
            connections,
            notifier,
            pipeline,
            tls,
            local_addr: Mutex::new(None),
            io_runtime: Mutex::new(None),
            shutdown: CancellationToken::new(),
            channels_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Registers `processor` for `code`. Without a scheduler it runs on the
    /// server's callback scheduler.
    pub fn register_processor(
        &self,
        code: i32,
        processor: Arc<dyn Processor>,
        scheduler: Option<Arc<ElasticScheduler>>,
    ) {
        self.engine.register_processor(code, processor, scheduler);
    }

    /// Registers the processor for codes with no specific processor.
    pub fn register_default_processor(
        &self,
        processor: Arc<dyn Processor>,
        scheduler: Option<Arc<ElasticScheduler>>,
    ) {
        self.engine.register_default_processor(processor, scheduler);
    }

    /// Appends an RPC hook.
    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.engine.register_rpc_hook(hook);
    }

    /// Processor and scheduler registered for `code`.
    pub fn processor_pair(&self, code: i32) -> Option<ProcessorEntry> {
        self.engine.processor_pair(code)
    }

    /// Scheduler running callbacks and default-scheduled processors.
    pub fn callback_executor(&self) -> &Arc<ElasticScheduler> {
        self.engine.scheduler()
    }

    /// Binds the listener and starts accepting.
    ///
    /// Returns the bound address. A bind failure is returned as
    /// `BindFailure` and leaves the server stopped.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = *self.local_addr.lock() {
            return Ok(addr);
        }

        let io = self.io_handle()?;
        let bind_addr = self.config.listen_addr.clone();
        // bound on the I/O runtime so the listener registers with its reactor
        let listener = io
            .spawn(async move { TcpListener::bind(bind_addr).await })
            .await
            .map_err(|e| RemotingError::Io(std::io::Error::other(e)))?
            .map_err(|source| RemotingError::BindFailure {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        self.notifier.start()?;

        let acceptor = Acceptor {
            pipeline: Arc::clone(&self.pipeline),
            tls: self.tls.clone(),
            channels_token: self.channels_token.clone(),
            nodelay: self.config.nodelay,
            all_idle: idle_interval(self.config.all_idle_time_ms),
            max_frame_length: self.config.max_frame_length,
        };
        let accept_task = io.spawn(acceptor.run(listener, self.shutdown.clone()));
        let sweep_task = self.engine.spawn_sweeper(
            Duration::from_millis(self.config.scan_interval_ms),
            self.shutdown.clone(),
        );
        self.tasks.lock().extend([accept_task, sweep_task]);

        *self.local_addr.lock() = Some(local_addr);
        info!(addr = %local_addr, tls = self.tls.is_some(), "remoting server listening");
        Ok(local_addr)
    }

    // Dedicated I/O runtime, built on first use, or the caller's runtime.
    fn io_handle(&self) -> Result<Handle> {
        if self.config.io_threads == 0 {
            return Ok(Handle::current());
        }
        let mut slot = self.io_runtime.lock();
        let runtime = match slot.take() {
            Some(runtime) => runtime,
            None => {
                debug!(io_threads = self.config.io_threads, "starting server I/O runtime");
                build_io_runtime(self.config.io_threads)?
            }
        };
        let handle = runtime.handle().clone();
        *slot = Some(runtime);
        Ok(handle)
    }

    /// Worker threads of the dedicated I/O runtime, if one is running.
    pub fn io_worker_threads(&self) -> Option<usize> {
        self.io_runtime
            .lock()
            .as_ref()
            .map(|runtime| runtime.metrics().num_workers())
    }

    fn stop_io_runtime(&self) {
        if let Some(runtime) = self.io_runtime.lock().take() {
            runtime.shutdown_background();
        }
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Currently connected channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.connections.channels()
    }

    /// Sends a request to a connected client and waits for the response.
    pub async fn invoke_sync(&self, channel: &Channel, request: Command, timeout: Duration) -> Result<Command> {
        self.engine.invoke_sync(channel, request, timeout).await
    }

    /// Sends a request to a connected client; `callback` receives the outcome.
    pub fn invoke_async<F>(&self, channel: &Channel, request: Command, timeout: Duration, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Command>) + Send + 'static,
    {
        self.engine.invoke_async(channel, request, timeout, callback)
    }

    /// Sends a one-way request to a connected client.
    pub async fn invoke_oneway(&self, channel: &Channel, request: Command, timeout: Duration) -> Result<()> {
        self.engine.invoke_oneway(channel, request, timeout).await
    }

    /// The invocation engine.
    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot()
    }

    /// Stops accepting, drains in-flight requests, closes every channel and
    /// stops the notifier and callback scheduler.
    pub async fn shutdown(&self) {
        info!("remoting server shutting down");
        self.shutdown.cancel();

        let quiesce = Duration::from_millis(self.config.quiesce_period_ms);
        let cutoff = Duration::from_millis(self.config.shutdown_timeout_ms);
        let drained = self.engine.drain().wait_drained(quiesce, cutoff).await;

        self.channels_token.cancel();
        let deadline = tokio::time::Instant::now() + cutoff;
        while !self.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.connections.is_empty() {
            warn!(remaining = self.connections.len(), "channels still registered after shutdown cutoff");
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let notifier = Arc::clone(&self.notifier);
        if tokio::task::spawn_blocking(move || notifier.stop()).await.is_err() {
            warn!("event notifier did not stop cleanly");
        }
        self.engine.scheduler().dispose();
        self.stop_io_runtime();
        info!(drain = ?drained, "remoting server stopped");
    }
}

impl Drop for RemotingServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.channels_token.cancel();
        self.stop_io_runtime();
    }
}

fn idle_interval(all_idle_time_ms: u64) -> Option<Duration> {
    (all_idle_time_ms > 0).then(|| Duration::from_millis(all_idle_time_ms))
}

struct Acceptor {
    pipeline: Arc<Pipeline>,
    tls: Option<TlsAcceptor>,
    channels_token: CancellationToken,
    nodelay: bool,
    all_idle: Option<Duration>,
    max_frame_length: usize,
}

impl Acceptor {
    async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.setup(stream, peer),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        debug!("accept loop stopped");
    }

    fn setup(&self, stream: TcpStream, peer: SocketAddr) {
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }
        }
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let peer = peer.to_string();
        let pipeline = Arc::clone(&self.pipeline);
        let token = self.channels_token.clone();
        let all_idle = self.all_idle;
        let max_frame_length = self.max_frame_length;

        match self.tls.clone() {
            None => {
                spawn_channel_limited(stream, peer, local, pipeline, &token, all_idle, max_frame_length);
            }
            Some(acceptor) => {
                tokio::spawn(async move {
                    let handshake = tokio::select! {
                        _ = token.cancelled() => return,
                        handshake = acceptor.accept(&peer, stream) => handshake,
                    };
                    match handshake {
                        Ok(tls_stream) => {
                            spawn_channel_limited(tls_stream, peer, local, pipeline, &token, all_idle, max_frame_length);
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "closing connection"),
                    }
                });
            }
        }
    }
}
