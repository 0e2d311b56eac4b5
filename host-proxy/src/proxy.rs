//! Reverse proxy handler and server

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::Response,
    routing::get,
    Router,
};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::acme::{CertManager, Http01Challenges};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::forward::Forwarder;
use crate::redirect::{acme_challenge, emit_redirect, redirect_to_https, target_url};
use crate::router::{request_host, HostRouter, Route};
use crate::tls::TlsListener;
use crate::writer::{ResponseBuffer, ResponseWriter, StatusRecorder};

/// Pause after a failed accept, typically a full file descriptor table
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The handler mounted behind TLS: redirect, proxy, or reject by host
pub struct ReverseProxy {
    router: HostRouter,
    forwarder: Forwarder,
}

impl ReverseProxy {
    pub fn new(router: HostRouter) -> Self {
        Self {
            router,
            forwarder: Forwarder::new(),
        }
    }

    pub fn router(&self) -> &HostRouter {
        &self.router
    }

    /// Handle one request
    pub async fn serve(&self, req: Request) -> Response {
        let host = request_host(&req).to_string();

        match self.router.route(&host) {
            Route::Redirect(target) => {
                // Requests reaching this handler arrived over TLS
                let scheme = req.uri().scheme_str().unwrap_or("https");
                let location = target_url(scheme, target, req.uri());

                let mut w = ResponseBuffer::new();
                emit_redirect(&mut w, req.method(), &location);
                w.into_response()
            }
            Route::Proxy(backend) => {
                let method = req.method().clone();
                let uri = req.uri().clone();

                let mut w = StatusRecorder::new(ResponseBuffer::new());
                self.forwarder.forward(&mut w, req, backend).await;

                let status = w.status();
                if status != StatusCode::OK {
                    warn!("{}", outcome_line(&method, &host, &uri, status));
                }
                w.into_inner().into_response()
            }
            Route::Unknown => {
                debug!("Unknown host: {:?}", host);
                // Answered with 200 rather than 404, matching the deployed behavior
                let mut w = ResponseBuffer::new();
                w.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                w.write_body(Body::from(format!("unknown host: {}", host)));
                w.into_response()
            }
        }
    }
}

/// `<METHOD> <host><escaped-path>?<raw-query> <status>`
pub fn outcome_line(method: &Method, host: &str, uri: &Uri, status: StatusCode) -> String {
    format!(
        "{} {}{}?{} {}",
        method,
        host,
        uri.path(),
        uri.query().unwrap_or_default(),
        status.as_u16()
    )
}

async fn dispatch(State(proxy): State<Arc<ReverseProxy>>, req: Request) -> Response {
    proxy.serve(req).await
}

/// Proxy server: the TLS reverse proxy plus the plaintext redirector
pub struct ProxyServer {
    config: ProxyConfig,
    proxy: Arc<ReverseProxy>,
    challenges: Http01Challenges,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let router = HostRouter::new(config.redirects.clone(), config.backends.clone());
        for host in router.shadowed_backends() {
            warn!("Backend for {} is unreachable: host is redirected", host);
        }

        Ok(Self {
            config,
            proxy: Arc::new(ReverseProxy::new(router)),
            challenges: Http01Challenges::default(),
        })
    }

    /// HTTP-01 answers served by the plaintext listener, to be filled by the
    /// certificate manager
    pub fn challenges(&self) -> &Http01Challenges {
        &self.challenges
    }

    /// Build the router served behind TLS
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .layer(CompressionLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(self.proxy.clone())
    }

    /// Build the router served on the plaintext listener
    pub fn redirect_router(&self) -> Router {
        Router::new()
            .route("/.well-known/acme-challenge/:token", get(acme_challenge))
            .fallback(redirect_to_https)
            .layer(TraceLayer::new_for_http())
            .with_state(self.challenges.clone())
    }

    /// Run both listeners until one fails or a termination signal arrives.
    /// Certificates are provisioned once the plaintext listener is up to
    /// answer HTTP-01 validation.
    pub async fn run(&self, certs: Arc<CertManager>) -> Result<()> {
        info!("Configured redirects:");
        for (host, target) in self.proxy.router().redirects() {
            info!("  {} -> {}", host, target);
        }
        info!("Configured backends:");
        for (host, backend) in self.proxy.router().backends() {
            info!("  {} -> {}", host, backend);
        }

        let tls = TlsListener::bind(&self.config.server.https_addr, certs.clone()).await?;
        let plain = TcpListener::bind(&self.config.server.http_addr).await?;
        info!("HTTP redirect listener bound on {}", plain.local_addr()?);

        certs.start_renewal_task();

        tokio::select! {
            res = self.serve_tls(tls) => {
                res?;
                Err(ProxyError::Listener("TLS listener stopped".to_string()))
            }
            res = self.serve_redirect(plain) => {
                res?;
                Err(ProxyError::Listener("HTTP listener stopped".to_string()))
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }

    /// Serve the reverse proxy on a TLS listener. Failed accepts and
    /// handshakes are logged and never stop the loop.
    pub async fn serve_tls(&self, listener: TlsListener) -> Result<()> {
        use hyper::service::service_fn;
        use tower::ServiceExt;

        let router = self.router();

        loop {
            let (accept, addr) = next_connection(|| listener.accept()).await;
            let router = router.clone();

            tokio::spawn(async move {
                match accept.await {
                    Ok(tls_stream) => {
                        let io = TokioIo::new(tls_stream);

                        let service = service_fn(move |mut req: hyper::Request<Incoming>| {
                            req.extensions_mut().insert(ConnectInfo(addr));
                            router.clone().oneshot(req)
                        });

                        if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                        {
                            debug!("Error serving connection from {}: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        debug!("TLS handshake failed from {}: {}", addr, e);
                    }
                }
            });
        }
    }

    /// Serve the HTTP to HTTPS redirector on a plaintext listener
    pub async fn serve_redirect(&self, listener: TcpListener) -> Result<()> {
        axum::serve(
            listener,
            self.redirect_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| ProxyError::Listener(format!("HTTP listener failed: {}", e)))?;

        Ok(())
    }
}

/// Retry `accept` until it yields a connection, backing off after each
/// failure
async fn next_connection<A, F, T>(mut accept: A) -> T
where
    A: FnMut() -> F,
    F: Future<Output = Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
