//! Error types for host-proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// ACME protocol error
    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    /// Server name outside the certificate allow-list
    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),

    /// A listener stopped serving
    #[error("Listener error: {0}")]
    Listener(String),
}
