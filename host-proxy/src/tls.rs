//! TLS listener
//!
//! Pairs a TCP listener with a rustls acceptor whose certificates come from
//! the [`CertManager`].

use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{Accept, TlsAcceptor};
use tracing::info;

use crate::acme::CertManager;
use crate::error::Result;

/// TCP listener whose connections are wrapped in TLS
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Wrap an already bound TCP listener
    pub fn new(listener: TcpListener, certs: Arc<CertManager>) -> Self {
        Self {
            listener,
            acceptor: build_acceptor(certs),
        }
    }

    /// Bind `addr` and serve certificates from `certs`
    pub async fn bind(addr: &str, certs: Arc<CertManager>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("TLS listener bound on {}", listener.local_addr()?);
        Ok(Self::new(listener, certs))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection. The returned future completes the TLS
    /// handshake, so it can be awaited off the accept loop.
    pub async fn accept(&self) -> Result<(Accept<TcpStream>, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((self.acceptor.accept(stream), addr))
    }
}

/// Build a TLS acceptor resolving certificates per server name
pub fn build_acceptor(certs: Arc<CertManager>) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(certs);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}
