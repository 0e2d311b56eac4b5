//! Request forwarding to backends
//!
//! Sends a request to a backend over plain HTTP and writes the backend's
//! response through a [`ResponseWriter`].

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{
        header::{self, HeaderName},
        uri::{Authority, PathAndQuery, Scheme},
        HeaderMap, HeaderValue, Request, StatusCode, Uri, Version,
    },
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{ProxyError, Result};
use crate::writer::ResponseWriter;

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

/// Headers that apply to a single connection and must not be forwarded
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to backends and streams their responses back
#[derive(Clone)]
pub struct Forwarder {
    client: HttpClient,
}

impl Forwarder {
    /// Create a new forwarder with a pooled HTTP/1.1 client
    pub fn new() -> Self {
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Self { client }
    }

    /// Forward `req` to `backend` (`host:port`) and write the response into `w`.
    ///
    /// Transport failures are logged and answered with `502 Bad Gateway`.
    pub async fn forward<W: ResponseWriter>(&self, w: &mut W, req: Request<Body>, backend: &str) {
        let req = match direct(req, backend) {
            Ok(req) => req,
            Err(e) => {
                error!("proxy error: {}", e);
                w.write_header(StatusCode::BAD_GATEWAY);
                return;
            }
        };

        debug!("Forwarding to: {}", req.uri());

        match self.client.request(req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                remove_hop_headers(&mut parts.headers);

                let headers = w.headers_mut();
                for (name, value) in parts.headers.iter() {
                    headers.append(name.clone(), value.clone());
                }
                w.write_header(parts.status);
                w.write_body(Body::new(body));
            }
            Err(e) => {
                error!("proxy error: {}", e);
                w.write_header(StatusCode::BAD_GATEWAY);
            }
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point a request at a backend: scheme `http`, authority `backend`, path
/// and query untouched. The `Host` header is left as the client sent it.
pub fn direct(req: Request<Body>, backend: &str) -> Result<Request<Body>> {
    let (mut parts, body) = req.into_parts();

    let authority: Authority = backend
        .parse()
        .map_err(|e| ProxyError::Http(format!("Invalid backend '{}': {}", backend, e)))?;

    // HTTP/2 clients send the host only as :authority
    if !parts.headers.contains_key(header::HOST) {
        if let Some(value) = parts
            .uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        {
            parts.headers.insert(header::HOST, value);
        }
    }

    let mut uri = parts.uri.into_parts();
    uri.scheme = Some(Scheme::HTTP);
    uri.authority = Some(authority);
    if uri.path_and_query.is_none() {
        uri.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = Uri::from_parts(uri).map_err(|e| ProxyError::Http(e.to_string()))?;
    parts.version = Version::HTTP_11;

    remove_hop_headers(&mut parts.headers);

    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        append_forwarded_for(&mut parts.headers, *addr);
    }

    Ok(Request::from_parts(parts, body))
}

/// Strip hop-by-hop headers, including any named by `Connection`
fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let client_ip = addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}
