//! TLS for remoting channels.
//!
//! Servers present a certificate chain; client certificates are not
//! requested. Clients verify the server against a configured CA bundle.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::TlsConfig;
use crate::error::{RemotingError, Result};

/// Server-side TLS handshake.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Builds an acceptor from the server certificate chain and key.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RemotingError::TlsConfig {
                reason: format!("failed to set server cert: {}", e),
            })?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Runs the server handshake over `stream`.
    pub async fn accept<IO>(&self, peer: &str, stream: IO) -> Result<tokio_rustls::server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| RemotingError::TlsHandshake {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Client-side TLS handshake.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Builds a connector trusting the CA certificates in `ca_cert_pem`.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let ca_certs = load_certs_from_pem(&config.ca_cert_pem)?;

        let mut root_store = rustls::RootCertStore::empty();
        for cert in ca_certs {
            root_store.add(cert).map_err(|e| RemotingError::TlsConfig {
                reason: format!("failed to add CA cert: {}", e),
            })?;
        }

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Runs the client handshake, verifying the server as `domain`.
    pub async fn connect<IO>(&self, domain: &str, stream: IO) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| RemotingError::TlsConfig {
                reason: format!("invalid server name {}: {}", domain, e),
            })?
        };
        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| RemotingError::TlsHandshake {
                peer: domain.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Loads every certificate in `pem`.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RemotingError::TlsConfig {
            reason: format!("invalid certificate PEM: {}", e),
        })?;

    if certs.is_empty() {
        return Err(RemotingError::TlsConfig {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Loads the first PKCS#8, PKCS#1 or SEC1 private key in `pem`.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| RemotingError::TlsConfig {
            reason: format!("invalid private key PEM: {}", e),
        })?
        .ok_or_else(|| RemotingError::TlsConfig {
            reason: "no private key found in PEM".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// (ca_cert_pem, node_cert_pem, node_key_pem) with SAN "localhost".
    fn generate_certs() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let node_key = rcgen::KeyPair::generate().unwrap();
        let node_params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let node_cert = node_params.signed_by(&node_key, &ca_cert, &ca_key).unwrap();

        (
            ca_cert.pem().into_bytes(),
            node_cert.pem().into_bytes(),
            node_key.serialize_pem().into_bytes(),
        )
    }

    fn configs() -> (TlsConfig, TlsConfig) {
        let (ca, cert, key) = generate_certs();
        let server = TlsConfig {
            cert_chain_pem: cert,
            private_key_pem: key,
            ..TlsConfig::default()
        };
        let client = TlsConfig {
            ca_cert_pem: ca,
            server_name: Some("localhost".to_string()),
            ..TlsConfig::default()
        };
        (server, client)
    }

    #[test]
    fn test_load_certs_from_pem() {
        let (ca, cert, _) = generate_certs();
        assert_eq!(load_certs_from_pem(&ca).unwrap().len(), 1);
        assert_eq!(load_certs_from_pem(&cert).unwrap().len(), 1);
    }

    #[test]
    fn test_load_certs_rejects_empty() {
        assert!(matches!(
            load_certs_from_pem(b"not a pem"),
            Err(RemotingError::TlsConfig { .. })
        ));
    }

    #[test]
    fn test_load_private_key_from_pem() {
        let (_, _, key) = generate_certs();
        assert!(!load_private_key_from_pem(&key).unwrap().secret_der().is_empty());
        assert!(load_private_key_from_pem(b"").is_err());
    }

    #[test]
    fn test_acceptor_requires_key() {
        let (mut server, _) = configs();
        server.private_key_pem.clear();
        assert!(TlsAcceptor::new(&server).is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (server_cfg, client_cfg) = configs();
        let acceptor = TlsAcceptor::new(&server_cfg).unwrap();
        let connector = TlsConnector::new(&client_cfg).unwrap();
        let (a, b) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept("client", a).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = connector.connect("localhost", b).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_server_name_fails_handshake() {
        let (server_cfg, client_cfg) = configs();
        let acceptor = TlsAcceptor::new(&server_cfg).unwrap();
        let connector = TlsConnector::new(&client_cfg).unwrap();
        let (a, b) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move { acceptor.accept("client", a).await.is_err() });
        let result = connector.connect("other.example", b).await;
        assert!(matches!(result, Err(RemotingError::TlsHandshake { .. })));
        assert!(server.await.unwrap());
    }
}
