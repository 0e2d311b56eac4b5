//! Redirect responses
//!
//! Shared by the canonical-host redirects of the reverse proxy and by the
//! plaintext listener, which sends every request to its HTTPS equivalent
//! except the certificate authority's HTTP-01 validation requests.

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use html_escape::encode_double_quoted_attribute;
use tracing::{debug, warn};

use crate::acme::Http01Challenges;
use crate::router::request_host;
use crate::writer::{ResponseBuffer, ResponseWriter};

/// Build `scheme://host/path?query` from a request URI, replacing its
/// scheme and host
pub fn target_url(scheme: &str, host: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, host, path_and_query)
}

/// Write a `302 Found` pointing at `location`.
///
/// GET requests also receive a short HTML note linking to the target, for
/// user agents that do not follow redirects.
pub fn emit_redirect<W: ResponseWriter>(w: &mut W, method: &Method, location: &str) {
    let value = match HeaderValue::try_from(location) {
        Ok(value) => value,
        Err(e) => {
            warn!("Invalid redirect location {:?}: {}", location, e);
            w.write_header(StatusCode::BAD_REQUEST);
            return;
        }
    };
    w.headers_mut().insert(header::LOCATION, value);

    let code = StatusCode::FOUND;
    if *method != Method::GET {
        w.write_header(code);
        return;
    }

    w.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    w.write_header(code);

    let note = format!(
        "<a href=\"{}\">{}</a>.\n\n",
        encode_double_quoted_attribute(location),
        code.canonical_reason().unwrap_or_default()
    );
    w.write_body(note.into());
}

/// Plaintext handler: redirect every request to HTTPS on the same host
pub async fn redirect_to_https(req: Request) -> Response {
    let location = target_url("https", request_host(&req), req.uri());

    let mut w = ResponseBuffer::new();
    emit_redirect(&mut w, req.method(), &location);
    w.into_response()
}

/// Plaintext handler for `/.well-known/acme-challenge/{token}`
pub async fn acme_challenge(
    State(challenges): State<Http01Challenges>,
    Path(token): Path<String>,
) -> Response {
    match challenges.get(&token) {
        Some(key_authorization) => {
            debug!("Answering HTTP-01 challenge {}", token);
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                key_authorization,
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
