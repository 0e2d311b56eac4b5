//! Host router for host-proxy
//!
//! Decides, from the request's host alone, whether a request is redirected
//! to a canonical host, proxied to a backend, or rejected as unknown.

use axum::http::{header, Request};
use std::collections::HashMap;

/// Disposition of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// Redirect to the canonical host
    Redirect(&'a str),
    /// Forward to the backend `host:port`
    Proxy(&'a str),
    /// Neither table knows the host
    Unknown,
}

/// Router over the redirect and backend tables
///
/// Both tables are fixed at construction. Hosts are matched exactly, as they
/// appear in the request (including any port).
#[derive(Debug, Clone, Default)]
pub struct HostRouter {
    redirects: HashMap<String, String>,
    backends: HashMap<String, String>,
}

impl HostRouter {
    /// Create a new router from the two tables
    pub fn new(redirects: HashMap<String, String>, backends: HashMap<String, String>) -> Self {
        Self {
            redirects,
            backends,
        }
    }

    /// Route a host. Redirects take priority over backends.
    pub fn route(&self, host: &str) -> Route<'_> {
        if let Some(target) = self.redirects.get(host) {
            return Route::Redirect(target);
        }
        if let Some(backend) = self.backends.get(host) {
            return Route::Proxy(backend);
        }
        Route::Unknown
    }

    /// Hosts whose backend entry can never be reached because a redirect
    /// entry exists for the same host
    pub fn shadowed_backends(&self) -> impl Iterator<Item = &str> {
        self.backends
            .keys()
            .filter(|host| self.redirects.contains_key(*host))
            .map(String::as_str)
    }

    /// Configured redirects
    pub fn redirects(&self) -> &HashMap<String, String> {
        &self.redirects
    }

    /// Configured backends
    pub fn backends(&self) -> &HashMap<String, String> {
        &self.backends
    }
}

/// Host the client asked for: the `Host` header, or the URI authority for
/// HTTP/2 requests. Empty when neither is present.
pub fn request_host<B>(req: &Request<B>) -> &str {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("")
}
