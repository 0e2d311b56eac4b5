//! Response writers
//!
//! Handlers in this crate produce their responses through [`ResponseWriter`]
//! so the forwarding path can be observed by [`StatusRecorder`] without
//! altering what reaches the client.

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use tracing::debug;

/// Incremental construction of an HTTP response
pub trait ResponseWriter {
    /// Response headers, editable until the body is written
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Write the status line. Only the first call has an effect.
    fn write_header(&mut self, status: StatusCode);

    /// Write the body. Implies `200 OK` when no status was written yet.
    fn write_body(&mut self, body: Body);
}

/// Writer that buffers the parts of a response until it is handed to axum
#[derive(Default)]
pub struct ResponseBuffer {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<Body>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish the response
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.body.unwrap_or_else(Body::empty));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseWriter for ResponseBuffer {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        match self.status {
            Some(current) => debug!("superfluous status write {} (already {})", status, current),
            None => self.status = Some(status),
        }
    }

    fn write_body(&mut self, body: Body) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body = Some(body);
    }
}

/// Decorator that remembers the status written through it
///
/// Every call is delegated to the wrapped writer; only `write_header` is
/// observed on the way.
#[derive(Debug)]
pub struct StatusRecorder<W> {
    inner: W,
    status: Option<StatusCode>,
}

impl<W: ResponseWriter> StatusRecorder<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            status: None,
        }
    }

    /// The first status written, or `200 OK` if none was written explicitly
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Release the wrapped writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: ResponseWriter> ResponseWriter for StatusRecorder<W> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
        }
        self.inner.write_header(status);
    }

    fn write_body(&mut self, body: Body) {
        self.inner.write_body(body);
    }
}
