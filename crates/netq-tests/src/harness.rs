//! Test Harness - servers, processors and certificates for remoting tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use netq_remoting::config::{ClientConfig, ServerConfig, TlsConfig};
use netq_remoting::{response_code, Channel, Command, Processor, RemotingClient, RemotingServer, RpcHook};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once per process; filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .try_init();
    });
}

/// A started server and a started client pointed at it.
pub struct TestPair {
    pub server: RemotingServer,
    pub client: RemotingClient,
    pub addr: SocketAddr,
}

impl TestPair {
    /// Address string for client calls.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub async fn shutdown(self) {
        self.client.shutdown().await;
        self.server.shutdown().await;
    }
}

/// Server config on an ephemeral loopback port.
pub fn local_server_config() -> ServerConfig {
    let mut config = ServerConfig::listening_on("127.0.0.1:0");
    config.io_threads = 2;
    config
}

/// Starts a server (after `setup` registers processors) and a client.
pub async fn start_pair(
    server_config: ServerConfig,
    client_config: ClientConfig,
    setup: impl FnOnce(&RemotingServer),
) -> anyhow::Result<TestPair> {
    init_tracing();
    let server = RemotingServer::new(server_config)?;
    setup(&server);
    let addr = server.start().await?;
    let client = RemotingClient::new(client_config)?;
    client.start()?;
    tracing::debug!(%addr, "test pair started");
    Ok(TestPair { server, client, addr })
}

/// Replies with the request body.
pub fn echo_processor() -> Arc<dyn Processor> {
    Arc::new(|_: &Channel, request: Command| -> netq_remoting::Result<Option<Command>> {
        Ok(Some(Command::response(response_code::SUCCESS, request.body)))
    })
}

/// Sleeps `delay` on the worker, then echoes.
pub fn delayed_echo(delay: Duration) -> Arc<dyn Processor> {
    Arc::new(move |_: &Channel, request: Command| -> netq_remoting::Result<Option<Command>> {
        std::thread::sleep(delay);
        Ok(Some(Command::response(response_code::SUCCESS, request.body)))
    })
}

/// Counts invocations and returns a response that one-way callers must never see.
pub fn counting_processor(hits: Arc<AtomicUsize>) -> Arc<dyn Processor> {
    Arc::new(move |_: &Channel, _request: Command| -> netq_remoting::Result<Option<Command>> {
        hits.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Command::response(response_code::SUCCESS, b"ignored".to_vec())))
    })
}

/// Hook tagging outgoing requests and counting observed responses.
#[derive(Default)]
pub struct TaggingHook {
    pub before: AtomicUsize,
    pub after: AtomicUsize,
}

impl RpcHook for TaggingHook {
    fn before_request(&self, _remote_addr: &str, request: &mut Command) -> netq_remoting::Result<()> {
        self.before.fetch_add(1, Ordering::SeqCst);
        request.headers.insert("x-trace".to_string(), "harness".to_string());
        Ok(())
    }

    fn after_response(&self, _remote_addr: &str, _request: &Command, _response: &Command) -> netq_remoting::Result<()> {
        self.after.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Generates a throwaway CA and a server certificate for `server_name`.
///
/// Returns (server TLS config, client TLS config trusting the CA).
pub fn generate_tls_pair(server_name: &str) -> anyhow::Result<(TlsConfig, TlsConfig)> {
    let ca_key = rcgen::KeyPair::generate()?;
    let mut ca_params = rcgen::CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let node_key = rcgen::KeyPair::generate()?;
    let node_cert = rcgen::CertificateParams::new(vec![server_name.to_string()])?
        .signed_by(&node_key, &ca_cert, &ca_key)?;

    let server = TlsConfig {
        cert_chain_pem: node_cert.pem().into_bytes(),
        private_key_pem: node_key.serialize_pem().into_bytes(),
        ..TlsConfig::default()
    };
    let client = TlsConfig {
        ca_cert_pem: ca_cert.pem().into_bytes(),
        server_name: Some(server_name.to_string()),
        ..TlsConfig::default()
    };
    Ok((server, client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_tls_pair() {
        let (server, client) = generate_tls_pair("localhost").unwrap();
        assert!(String::from_utf8_lossy(&server.cert_chain_pem).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&server.private_key_pem).contains("PRIVATE KEY"));
        assert_eq!(client.server_name.as_deref(), Some("localhost"));
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
        assert!(wait_until(Duration::from_millis(30), || true).await);
    }
}
