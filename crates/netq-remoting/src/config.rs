//! Configuration for the remoting server, client and worker scheduler.
//!
//! Every struct derives serde with `#[serde(default)]`, so an embedding
//! application can load a partial document and inherit the remaining defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::MAX_FRAME_LENGTH;

/// What the connection manager does when a channel has been all-idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Log the idle event and keep the channel open.
    #[default]
    Log,
    /// Close the channel.
    Close,
}

/// PEM material for TLS.
///
/// Servers use `cert_chain_pem` and `private_key_pem`. Clients trust
/// `ca_cert_pem` and verify the server against `server_name` (or the host
/// part of the dialed address when unset).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM-encoded certificate chain presented by the server.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key of the server.
    pub private_key_pem: Vec<u8>,
    /// PEM-encoded CA certificates trusted by the client.
    pub ca_cert_pem: Vec<u8>,
    /// Server name the client expects in the certificate.
    pub server_name: Option<String>,
}

/// Elastic worker scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Permanent workers, started eagerly (default: 4).
    pub core_threads: usize,
    /// Hard ceiling on total workers (default: 4).
    pub max_threads: usize,
    /// Grace period after which an idle auxiliary worker exits (default: 20000).
    pub idle_timeout_ms: u64,
    /// Worker thread name prefix; workers are named `<prefix><n>`.
    pub thread_name_prefix: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            core_threads: 4,
            max_threads: 4,
            idle_timeout_ms: 20_000,
            thread_name_prefix: None,
        }
    }
}

impl SchedulerConfig {
    /// Creates a config with `core` permanent workers growing up to `max`.
    pub fn new(core: usize, max: usize) -> Self {
        Self {
            core_threads: core,
            max_threads: max,
            ..Self::default()
        }
    }

    /// Creates a fixed-size config (`core == max`).
    pub fn fixed(threads: usize) -> Self {
        Self::new(threads, threads)
    }

    /// Sets the worker thread name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Sets the auxiliary idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout_ms = idle_timeout.as_millis() as u64;
        self
    }

    /// Auxiliary idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Remoting server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (default: "0.0.0.0:8888").
    pub listen_addr: String,
    /// Worker threads of the dedicated I/O runtime; 0 runs I/O on the
    /// runtime `start` is called from (default: 2x available parallelism).
    pub io_threads: usize,
    /// All-idle interval in milliseconds; 0 disables idle detection (default: 120000).
    pub all_idle_time_ms: u64,
    /// Reaction to an idle channel (default: log).
    pub idle_policy: IdlePolicy,
    /// Period of the pending-call expiry sweep (default: 3000).
    pub scan_interval_ms: u64,
    /// Concurrent callback-mode calls in flight (default: 64).
    pub permits_async: usize,
    /// Concurrent one-way sends in flight (default: 256).
    pub permits_oneway: usize,
    /// Threads of the callback scheduler; at least 4 are started (default: 4).
    pub callback_threads: usize,
    /// Quiesce window on shutdown (default: 100).
    pub quiesce_period_ms: u64,
    /// Forced shutdown cutoff (default: 1000).
    pub shutdown_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY on accepted sockets (default: true).
    pub nodelay: bool,
    /// Longest inbound frame payload accepted; capped at `i32::MAX` (default: `i32::MAX`).
    pub max_frame_length: usize,
    /// Server-side TLS; plaintext when unset.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8888".to_string(),
            io_threads: default_io_threads(),
            all_idle_time_ms: 120_000,
            idle_policy: IdlePolicy::Log,
            scan_interval_ms: 3000,
            permits_async: 64,
            permits_oneway: 256,
            callback_threads: 4,
            quiesce_period_ms: 100,
            shutdown_timeout_ms: 1000,
            nodelay: true,
            max_frame_length: MAX_FRAME_LENGTH,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Creates a config listening on `addr` with all other defaults.
    pub fn listening_on(addr: impl Into<String>) -> Self {
        Self {
            listen_addr: addr.into(),
            ..Self::default()
        }
    }

    /// Scheduler config for the server callback executor.
    pub fn callback_scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::fixed(self.callback_threads.max(4)).with_name_prefix("netq-server-callback-")
    }
}

/// Remoting client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Dial timeout in milliseconds (default: 3000).
    pub connect_timeout_ms: u64,
    /// All-idle interval in milliseconds; 0 disables idle detection (default: 120000).
    pub all_idle_time_ms: u64,
    /// Reaction to an idle channel (default: log).
    pub idle_policy: IdlePolicy,
    /// Period of the pending-call expiry sweep (default: 3000).
    pub scan_interval_ms: u64,
    /// Concurrent callback-mode calls in flight (default: 65535).
    pub permits_async: usize,
    /// Concurrent one-way sends in flight (default: 65535).
    pub permits_oneway: usize,
    /// Threads of the callback scheduler (default: available parallelism).
    pub callback_threads: usize,
    /// Forced shutdown cutoff (default: 1000).
    pub shutdown_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY on dialed sockets (default: true).
    pub nodelay: bool,
    /// Longest inbound frame payload accepted; capped at `i32::MAX` (default: `i32::MAX`).
    pub max_frame_length: usize,
    /// Client-side TLS; plaintext when unset.
    pub tls: Option<TlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            all_idle_time_ms: 120_000,
            idle_policy: IdlePolicy::Log,
            scan_interval_ms: 3000,
            permits_async: 65535,
            permits_oneway: 65535,
            callback_threads: available_parallelism(),
            shutdown_timeout_ms: 1000,
            nodelay: true,
            max_frame_length: MAX_FRAME_LENGTH,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Scheduler config for the client callback executor.
    pub fn callback_scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::fixed(self.callback_threads.max(1)).with_name_prefix("netq-client-callback-")
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_io_threads() -> usize {
    available_parallelism() * 2
}

/// Builds a multi-threaded tokio runtime sized for channel I/O.
///
/// The server runs its listener and channels on one of these when
/// `io_threads` is non-zero.
pub fn build_io_runtime(io_threads: usize) -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(io_threads.max(1))
        .thread_name("netq-io")
        .enable_all()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.scan_interval_ms, 3000);
        assert_eq!(config.quiesce_period_ms, 100);
        assert_eq!(config.shutdown_timeout_ms, 1000);
        assert_eq!(config.idle_policy, IdlePolicy::Log);
        assert!(config.io_threads >= 2);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(20));
        assert_eq!(SchedulerConfig::fixed(3).max_threads, 3);
    }

    #[test]
    fn test_callback_scheduler_has_floor_of_four() {
        let mut config = ServerConfig::default();
        config.callback_threads = 1;
        let scheduler = config.callback_scheduler();
        assert_eq!(scheduler.core_threads, 4);
        assert_eq!(scheduler.max_threads, 4);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"listen_addr":"127.0.0.1:0","idle_policy":"close"}"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert_eq!(config.idle_policy, IdlePolicy::Close);
        assert_eq!(config.permits_async, 64);
        assert_eq!(config.max_frame_length, MAX_FRAME_LENGTH);
    }

    #[test]
    fn test_max_frame_length_from_document() {
        let config: ClientConfig = serde_json::from_str(r#"{"max_frame_length":65536}"#).unwrap();
        assert_eq!(config.max_frame_length, 65536);
        assert_eq!(ClientConfig::default().max_frame_length, MAX_FRAME_LENGTH);
    }

    #[test]
    fn test_build_io_runtime() {
        let rt = build_io_runtime(2).unwrap();
        let value = rt.block_on(async { 21 * 2 });
        assert_eq!(value, 42);
    }
}
