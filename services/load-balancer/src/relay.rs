//! Upstream forwarding and response relay
//!
//! Sends one attempt upstream with a subscription's credential and turns the
//! upstream response into an axum response. Non-streaming bodies are buffered in
//! full; streaming bodies are relayed chunk by chunk with the subscription's
//! [`Reservation`] moved into the body stream, so the slot stays held until the
//! last byte reaches the client or the client goes away.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;
use subscription_pool::{Credential, MAX_COOLDOWN, Pool, Reservation};
use tracing::{debug, error, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client-identifying header, used for per-client metrics and never forwarded.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Request-side headers replaced or recomputed for every attempt.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    CLIENT_ID_HEADER,
];

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Inbound headers minus hop-by-hop, client credentials and the client id.
pub fn upstream_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || STRIPPED_REQUEST_HEADERS.contains(&name_str) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// The parts of an inbound request replayed on every attempt.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream timeout after {0:?}")]
    Timeout(Duration),

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    /// Body read failed after the response head arrived.
    #[error("upstream body interrupted: {0}")]
    Interrupted(String),
}

impl ForwardError {
    pub fn label(&self) -> &'static str {
        match self {
            ForwardError::Timeout(_) => "timeout",
            ForwardError::Unreachable(_) => "unreachable",
            ForwardError::Interrupted(_) => "stream_interrupted",
        }
    }
}

/// Send one attempt and wait for the response headers.
///
/// `timeout` bounds the wait for headers; the client's read timeout bounds each
/// subsequent body read.
pub async fn send(
    client: &reqwest::Client,
    request: &UpstreamRequest,
    credential: &Credential,
    timeout: Duration,
) -> Result<reqwest::Response, ForwardError> {
    let mut headers = request.headers.clone();
    credential.apply(&mut headers);

    let pending = client
        .request(request.method.clone(), &request.url)
        .headers(headers)
        .body(request.body.clone())
        .send();

    match tokio::time::timeout(timeout, pending).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) if e.is_timeout() => Err(ForwardError::Timeout(timeout)),
        Ok(Err(e)) => Err(ForwardError::Unreachable(e.to_string())),
        Err(_) => Err(ForwardError::Timeout(timeout)),
    }
}

/// `Retry-After` in delta-seconds form, capped at [`MAX_COOLDOWN`].
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    value
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_COOLDOWN))
}

/// True when a JSON request body asks for a streamed response.
pub fn is_streaming_request(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|json| json.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

/// True when the upstream response is server-sent events.
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"))
}

fn response_builder(
    status: StatusCode,
    headers: &HeaderMap,
    streaming: bool,
) -> axum::http::response::Builder {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || (streaming && *name == header::CONTENT_LENGTH) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Read the whole upstream body, then build the client response.
///
/// The caller keeps the reservation until this returns. Nothing has reached the
/// client yet, so a stalled body is a timeout like a stalled head; any other read
/// failure is `Interrupted`.
pub async fn buffer_response(
    upstream: reqwest::Response,
    timeout: Duration,
) -> Result<Response, ForwardError> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = match tokio::time::timeout(timeout, upstream.bytes()).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) if e.is_timeout() => return Err(ForwardError::Timeout(timeout)),
        Ok(Err(e)) => return Err(ForwardError::Interrupted(e.to_string())),
        Err(_) => return Err(ForwardError::Timeout(timeout)),
    };

    response_builder(status, &headers, false)
        .body(Body::from(body))
        .or_else(|e| {
            error!(error = %e, "failed to build buffered response");
            Ok(internal_error())
        })
}

/// Relay the upstream body chunk by chunk, holding `reservation` until the
/// stream ends or is dropped.
pub fn stream_response(
    upstream: reqwest::Response,
    reservation: Reservation,
    pool: Arc<Pool>,
) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let stream = ReservedStream::new(upstream.bytes_stream(), reservation, pool);

    response_builder(status, &headers, true)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to build streaming response");
            internal_error()
        })
}

fn internal_error() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

pin_project! {
    /// Upstream body stream that owns a connection slot.
    ///
    /// The slot is released when the stream finishes, fails, or is dropped
    /// because the client disconnected. Dropping also drops the upstream body,
    /// which cancels the upstream request.
    pub struct ReservedStream<S> {
        #[pin]
        inner: S,
        reservation: Option<Reservation>,
        pool: Arc<Pool>,
        bytes_relayed: u64,
    }

    impl<S> PinnedDrop for ReservedStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(mut reservation) = this.reservation.take() {
                warn!(
                    subscription = reservation.name(),
                    bytes_relayed = *this.bytes_relayed,
                    reason = "client_disconnected",
                    "client disconnected mid-stream, cancelling upstream"
                );
                reservation.release();
            }
        }
    }
}

impl<S> ReservedStream<S> {
    pub fn new(inner: S, reservation: Reservation, pool: Arc<Pool>) -> Self {
        Self {
            inner,
            reservation: Some(reservation),
            pool,
            bytes_relayed: 0,
        }
    }
}

impl<S, E> Stream for ReservedStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                *this.bytes_relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(mut reservation) = this.reservation.take() {
                    let name = reservation.name().to_string();
                    error!(
                        subscription = name.as_str(),
                        bytes_relayed = *this.bytes_relayed,
                        error = %e,
                        reason = "stream_interrupted",
                        "upstream stream failed mid-response"
                    );
                    reservation.release();
                    let _ = this.pool.record_error(&name);
                    metrics::record_upstream_error("stream_interrupted");
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(mut reservation) = this.reservation.take() {
                    debug!(
                        subscription = reservation.name(),
                        bytes_relayed = *this.bytes_relayed,
                        "stream complete"
                    );
                    reservation.release();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
