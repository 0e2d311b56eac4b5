use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use host_proxy::{ProxyConfig, ProxyServer};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

/// Start a backend on an ephemeral port
async fn spawn_backend() -> SocketAddr {
    let app = Router::new()
        .route("/foo", get(echo).post(echo))
        .route("/fail", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "backend failure") }))
        .route("/big", get(|| async { "lorem ipsum dolor sit amet ".repeat(100) }))
        .route("/nobody", get(|| async { StatusCode::NO_CONTENT }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn echo(req: Request) -> impl IntoResponse {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let body = to_bytes(req.into_body(), usize::MAX).await.unwrap();

    format!(
        "{} host={} uri={} xff={} body={}",
        method,
        host,
        uri,
        forwarded_for,
        String::from_utf8_lossy(&body)
    )
}

fn test_config(backend: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.redirects =
        HashMap::from([("my.domain".to_string(), "www.my.domain".to_string())]);
    config.backends = HashMap::from([
        ("www.my.domain".to_string(), backend.to_string()),
        // Shadowed by the redirect above
        ("my.domain".to_string(), backend.to_string()),
    ]);
    config
}

fn request(method: Method, host: &str, uri: &str, body: Body) -> Request {
    axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, host)
        .body(body)
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Warnings written while a test runs
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let logs = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish()
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_redirect_to_canonical_host() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(Method::GET, "my.domain", "/foo?bar=1", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://www.my.domain/foo?bar=1"
    );
    let body = body_string(response).await;
    assert!(body.contains("<a href=\"https://www.my.domain/foo?bar=1\">Found</a>."));
}

#[tokio::test]
async fn test_post_redirect_has_empty_body() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(Method::POST, "my.domain", "/foo", Body::from("data")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(body_string(response).await.is_empty());
}

#[tokio::test]
async fn test_proxies_to_backend() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(
            Method::POST,
            "www.my.domain",
            "/foo?bar=1",
            Body::from("payload"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "POST host=www.my.domain uri=/foo?bar=1 xff= body=payload"
    );
}

#[tokio::test]
async fn test_backend_error_passes_through() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(Method::GET, "www.my.domain", "/fail", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "backend failure");
}

#[tokio::test]
async fn test_non_ok_response_is_logged() {
    let logs = CapturedLogs::default();
    let _guard = tracing::subscriber::set_default(logs.subscriber());

    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(Method::GET, "www.my.domain", "/fail?bar=1", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(logs.contents().contains("GET www.my.domain/fail?bar=1 500"));
}

#[tokio::test]
async fn test_ok_response_is_not_logged() {
    let logs = CapturedLogs::default();
    let _guard = tracing::subscriber::set_default(logs.subscriber());

    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(Method::GET, "www.my.domain", "/foo?bar=1", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!logs.contents().contains("www.my.domain/foo"));
}

#[tokio::test]
async fn test_unreachable_backend_is_logged() {
    let logs = CapturedLogs::default();
    let _guard = tracing::subscriber::set_default(logs.subscriber());

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let server = ProxyServer::new(test_config(dead)).unwrap();
    server
        .router()
        .oneshot(request(Method::POST, "www.my.domain", "/foo", Body::empty()))
        .await
        .unwrap();

    let logs = logs.contents();
    assert!(logs.contains("proxy error"));
    assert!(logs.contains("POST www.my.domain/foo? 502"));
}

#[tokio::test]
async fn test_backend_status_without_body() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(Method::GET, "www.my.domain", "/nobody", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let server = ProxyServer::new(test_config(dead)).unwrap();
    let response = server
        .router()
        .oneshot(request(Method::GET, "www.my.domain", "/foo", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_unknown_host_answers_ok() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .router()
        .oneshot(request(Method::GET, "unknown.example", "/", Body::empty()))
        .await
        .unwrap();

    // Known inconsistency: unknown hosts are answered with 200, not 404
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "unknown host: unknown.example");
}

#[tokio::test]
async fn test_proxied_response_is_compressed() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let mut req = request(Method::GET, "www.my.domain", "/big", Body::empty());
    req.headers_mut()
        .insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());
    let response = server.router().oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
}

#[tokio::test]
async fn test_plaintext_redirects_to_https() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();

    let response = server
        .redirect_router()
        .oneshot(request(Method::GET, "www.my.domain", "/x", Body::empty()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "https://www.my.domain/x");
}

#[tokio::test]
async fn test_plaintext_listener_over_tcp() {
    let backend = spawn_backend().await;
    let server = Arc::new(ProxyServer::new(test_config(backend)).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve_redirect(listener).await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /x?y=1 HTTP/1.1\r\nHost: www.my.domain\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_lowercase();

    assert!(text.starts_with("http/1.1 302 found"));
    assert!(text.contains("location: https://www.my.domain/x?y=1"));
}

#[tokio::test]
async fn test_plaintext_answers_acme_challenge() {
    let backend = spawn_backend().await;
    let server = ProxyServer::new(test_config(backend)).unwrap();
    server.challenges().insert("tok123", "tok123.thumbprint");

    let response = server
        .redirect_router()
        .oneshot(request(
            Method::GET,
            "www.my.domain",
            "/.well-known/acme-challenge/tok123",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "tok123.thumbprint");

    let response = server
        .redirect_router()
        .oneshot(request(
            Method::GET,
            "www.my.domain",
            "/.well-known/acme-challenge/unknown",
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
