//! Axum middleware that puts a route behind the window enforcer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, FromRequest, Multipart, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, instrument, warn};

use crate::ratelimit::{client_id, AdmissionRequest, Rejection, Window, WindowEnforcer};

/// Largest form body buffered while looking for the token.
const MAX_FORM_BYTES: usize = 64 * 1024;

/// Largest multipart body buffered while looking for the token. Matches
/// axum's default body limit.
const MAX_MULTIPART_BYTES: usize = 2 * 1024 * 1024;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const MULTIPART_CONTENT_TYPE: &str = "multipart/form-data";

/// Body encodings searched for the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormKind {
    UrlEncoded,
    Multipart,
}

/// Per-route state for [`enforce`].
#[derive(Debug, Clone)]
pub struct RouteGuard {
    enforcer: Arc<WindowEnforcer>,
    window: Option<Window>,
    token_field: Arc<str>,
}

impl RouteGuard {
    /// Guard a route with the enforcer's default window.
    pub fn new(enforcer: Arc<WindowEnforcer>, token_field: &str) -> Self {
        Self {
            enforcer,
            window: None,
            token_field: Arc::from(token_field),
        }
    }

    /// Use `window` for this route instead of the default.
    pub fn with_window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::InvalidRequest(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "The request could not be verified".to_string(),
                    code: "INVALID_REQUEST",
                    retry_after_secs: None,
                }),
            )
                .into_response(),
            Rejection::TooManyRequests { window } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorResponse {
                        error: format!(
                            "Too many requests; wait {} seconds before trying again",
                            window.as_secs()
                        ),
                        code: "TOO_MANY_REQUESTS",
                        retry_after_secs: Some(window.as_secs()),
                    }),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(window.as_secs()));
                response
            }
        }
    }
}

/// Admit or reject a request before it reaches the wrapped handler.
///
/// Use with `axum::middleware::from_fn_with_state(guard, enforce)`. The server
/// must be started with connect info so the peer address is available.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn enforce(State(guard): State<RouteGuard>, request: Request, next: Next) -> Response {
    let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>().cloned()
    else {
        error!("Peer address unavailable; serve with connect info");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let path = request.uri().path().to_string();
    let (token, request) = match extract_token(request, &guard.token_field).await {
        Ok(extracted) => extracted,
        Err(response) => return response,
    };

    let admission = AdmissionRequest::new(client_id(&peer), path, token);
    match guard.enforcer.admit(&admission, guard.window).await {
        Ok(_) => next.run(request).await,
        Err(rejection) => rejection.into_response(),
    }
}

/// Find the token in the query string, a urlencoded body or a multipart body.
///
/// A buffered body is put back so the handler can still read the form.
async fn extract_token(
    request: Request,
    field: &str,
) -> Result<(Option<String>, Request), Response> {
    if let Some(token) = request.uri().query().and_then(|q| find_field(q.as_bytes(), field)) {
        return Ok((Some(token), request));
    }

    let Some(kind) = form_kind(&request) else {
        return Ok((None, request));
    };

    let limit = match kind {
        FormKind::UrlEncoded => MAX_FORM_BYTES,
        FormKind::Multipart => MAX_MULTIPART_BYTES,
    };

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Unreadable form body on rate limited route");
            return Err(StatusCode::PAYLOAD_TOO_LARGE.into_response());
        }
    };

    let token = match kind {
        FormKind::UrlEncoded => find_field(&bytes, field),
        FormKind::Multipart => {
            let mut copy = Request::new(Body::from(bytes.clone()));
            if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
                copy.headers_mut()
                    .insert(header::CONTENT_TYPE, content_type.clone());
            }
            find_multipart_field(copy, field).await
        }
    };
    Ok((token, Request::from_parts(parts, Body::from(bytes))))
}

fn form_kind(request: &Request) -> Option<FormKind> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())?;

    if content_type.starts_with(FORM_CONTENT_TYPE) {
        Some(FormKind::UrlEncoded)
    } else if content_type.starts_with(MULTIPART_CONTENT_TYPE) {
        Some(FormKind::Multipart)
    } else {
        None
    }
}

/// Scan a buffered multipart body for a non-empty text part named `field`.
async fn find_multipart_field(request: Request, field: &str) -> Option<String> {
    let mut multipart = match Multipart::from_request(request, &()).await {
        Ok(multipart) => multipart,
        Err(e) => {
            warn!(error = %e, "Malformed multipart body on rate limited route");
            return None;
        }
    };

    loop {
        match multipart.next_field().await {
            Ok(Some(part)) => {
                if part.name() != Some(field) {
                    continue;
                }
                match part.text().await {
                    Ok(value) if !value.is_empty() => return Some(value),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Unreadable multipart token field");
                        return None;
                    }
                }
            }
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Malformed multipart body on rate limited route");
                return None;
            }
        }
    }
}

fn find_field(encoded: &[u8], field: &str) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(key, value)| key == field && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}
