//! host-proxy: host-based HTTPS reverse proxy
//!
//! Terminates TLS, looks at the request's host and either redirects it to a
//! canonical host, forwards it to the backend configured for that host, or
//! answers that the host is unknown. A plaintext listener redirects every
//! request to HTTPS.
//!
//! # Features
//!
//! - Exact host matching with redirects taking priority over backends
//! - ACME certificates per allowed host (HTTP-01 on the plaintext listener),
//!   cached on disk and renewed before expiry
//! - Gzip compression of proxied responses
//! - One log line per proxied request that did not end in `200 OK`
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! https_addr = "0.0.0.0:443"
//! http_addr = "0.0.0.0:80"
//!
//! [tls]
//! email = "admin@example.com"
//! cache_dir = "/var/cert"
//! hosts = ["example.com", "www.example.com"]
//! # "acme" (default) or "self-signed" for development
//! issuer = "acme"
//! directory_url = "https://acme-v02.api.letsencrypt.org/directory"
//!
//! [redirects]
//! "example.com" = "www.example.com"
//!
//! [backends]
//! "www.example.com" = "localhost:3000"
//! ```

pub mod acme;
pub mod config;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod redirect;
pub mod router;
pub mod tls;
pub mod writer;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use proxy::{ProxyServer, ReverseProxy};
pub use router::{HostRouter, Route};
