//! Remoting client: dials peers on demand and caches one channel per address.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{spawn_channel_limited, Channel};
use crate::config::ClientConfig;
use crate::connection::{ChannelEventListener, ConnectionManager, LifecycleNotifier};
use crate::error::{RemotingError, Result};
use crate::invoke::InvocationEngine;
use crate::metrics::{MetricsSnapshot, RemotingMetrics};
use crate::pipeline::{Pipeline, Stage};
use crate::processor::{Processor, RpcHook};
use crate::protocol::Command;
use crate::scheduler::ElasticScheduler;
use crate::tls::TlsConnector;

/// Calls remote servers by address.
///
/// Channels are dialed lazily on first use and redialed once closed. The
/// client can serve requests the server sends back over those channels.
pub struct RemotingClient {
    config: ClientConfig,
    engine: Arc<InvocationEngine>,
    connections: Arc<ConnectionManager>,
    notifier: Arc<LifecycleNotifier>,
    pipeline: Arc<Pipeline>,
    tls: Option<TlsConnector>,
    channels: DashMap<String, Channel>,
    connect_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    shutdown: CancellationToken,
    channels_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemotingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingClient")
            .field("channels", &self.channels.len())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl RemotingClient {
    /// Creates a client without a lifecycle listener.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates a client reporting channel events to `listener`.
    pub fn with_listener(config: ClientConfig, listener: Arc<dyn ChannelEventListener>) -> Result<Self> {
        Self::build(config, Some(listener))
    }

    fn build(config: ClientConfig, listener: Option<Arc<dyn ChannelEventListener>>) -> Result<Self> {
        let tls = config.tls.as_ref().map(TlsConnector::new).transpose()?;
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
            channels: DashMap::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            channels_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Starts the lifecycle notifier and the expiry sweep. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.notifier.start()?;
        let sweeper = self.engine.spawn_sweeper(
            Duration::from_millis(self.config.scan_interval_ms),
            self.shutdown.clone(),
        );
        *self.sweeper.lock() = Some(sweeper);
        debug!("remoting client started");
        Ok(())
    }

    /// Registers a processor for requests the server sends to this client.
    pub fn register_processor(
        &self,
        code: i32,
        processor: Arc<dyn Processor>,
        scheduler: Option<Arc<ElasticScheduler>>,
    ) {
        self.engine.register_processor(code, processor, scheduler);
    }

    /// Appends an RPC hook.
    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.engine.register_rpc_hook(hook);
    }

    /// Returns the active channel to `addr`, dialing if needed.
    pub async fn channel(&self, addr: &str) -> Result<Channel> {
        if let Some(channel) = self.cached(addr) {
            return Ok(channel);
        }
        let _guard = self.connect_lock.lock().await;
        if let Some(channel) = self.cached(addr) {
            return Ok(channel);
        }
        let channel = self.connect(addr).await?;
        self.channels.insert(addr.to_string(), channel.clone());
        Ok(channel)
    }

    fn cached(&self, addr: &str) -> Option<Channel> {
        let channel = self.channels.get(addr).map(|e| e.value().clone())?;
        if channel.is_active() {
            Some(channel)
        } else {
            self.channels.remove_if(addr, |_, c| !c.is_active());
            None
        }
    }

    async fn connect(&self, addr: &str) -> Result<Channel> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RemotingError::SendFailure {
                    addr: addr.to_string(),
                    reason: format!("connect failed: {}", e),
                })
            }
            Err(_) => {
                return Err(RemotingError::SendFailure {
                    addr: addr.to_string(),
                    reason: format!("connect timed out after {}ms", self.config.connect_timeout_ms),
                })
            }
        };
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = addr, error = %e, "failed to set TCP_NODELAY");
            }
        }
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let all_idle = (self.config.all_idle_time_ms > 0)
            .then(|| Duration::from_millis(self.config.all_idle_time_ms));
        let pipeline = Arc::clone(&self.pipeline);
        let max_frame_length = self.config.max_frame_length;

        let channel = match &self.tls {
            None => spawn_channel_limited(
                stream,
                addr.to_string(),
                local,
                pipeline,
                &self.channels_token,
                all_idle,
                max_frame_length,
            ),
            Some(connector) => {
                let server_name = self
                    .config
                    .tls
                    .as_ref()
                    .and_then(|tls| tls.server_name.clone())
                    .unwrap_or_else(|| host_of(addr).to_string());
                let tls_stream = connector.connect(&server_name, stream).await?;
                spawn_channel_limited(
                    tls_stream,
                    addr.to_string(),
                    local,
                    pipeline,
                    &self.channels_token,
                    all_idle,
                    max_frame_length,
                )
            }
        };
        info!(peer = addr, channel = channel.id(), "connected");
        Ok(channel)
    }

    /// Sends a request to `addr` and waits for the response.
    ///
    /// `timeout` covers dialing as well as the call.
    pub async fn invoke_sync(&self, addr: &str, request: Command, timeout: Duration) -> Result<Command> {
        let started = Instant::now();
        let channel = self.channel(addr).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(RemotingError::Timeout {
                addr: addr.to_string(),
                correlation_id: request.correlation_id,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        self.engine.invoke_sync(&channel, request, remaining).await
    }

    /// Sends a request to `addr`; `callback` receives the outcome.
    ///
    /// A dial failure is returned directly and `callback` is not called.
    pub async fn invoke_async<F>(&self, addr: &str, request: Command, timeout: Duration, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Command>) + Send + 'static,
    {
        let channel = self.channel(addr).await?;
        self.engine.invoke_async(&channel, request, timeout, callback)
    }

    /// Sends a one-way request to `addr`.
    pub async fn invoke_oneway(&self, addr: &str, request: Command, timeout: Duration) -> Result<()> {
        let channel = self.channel(addr).await?;
        self.engine.invoke_oneway(&channel, request, timeout).await
    }

    /// Closes the channel to `addr`, cancelling its pending calls.
    pub fn close_channel(&self, addr: &str) {
        if let Some((_, channel)) = self.channels.remove(addr) {
            channel.close();
        }
    }

    /// The invocation engine.
    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot()
    }

    /// Closes every channel and stops background work.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.channels_token.cancel();
        self.channels.clear();

        let cutoff = Duration::from_millis(self.config.shutdown_timeout_ms);
        let deadline = tokio::time::Instant::now() + cutoff;
        while !self.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.connections.is_empty() {
            warn!(remaining = self.connections.len(), "channels still registered after shutdown cutoff");
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        let notifier = Arc::clone(&self.notifier);
        if tokio::task::spawn_blocking(move || notifier.stop()).await.is_err() {
            warn!("event notifier did not stop cleanly");
        }
        self.engine.scheduler().dispose();
        info!("remoting client stopped");
    }
}

impl Drop for RemotingClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.channels_token.cancel();
    }
}

// "host:port" or "[v6]:port" to the host part.
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']')
}
