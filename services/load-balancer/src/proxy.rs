//! Request handling
//!
//! Drives one inbound request through the failover state machine: select a
//! subscription, reserve a slot, forward with that subscription's credential,
//! and on a 429 put the subscription into cooldown and try the next one. The
//! upstream response is relayed verbatim apart from the substituted credential.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use subscription_pool::{
    AttemptAction, AttemptEvent, AttemptState, Error as PoolError, FailureReason, Pool, RequestAttempt,
    Reservation,
};
use tracing::{debug, error, info, instrument, warn};

use crate::metrics;
use crate::relay::{self, CLIENT_ID_HEADER, ForwardError, UpstreamRequest};

/// Request bodies above this size are rejected with 400.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub pool: Arc<Pool>,
    pub max_retries: u32,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Decrements `in_flight` when the request finishes or is cancelled.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn failure_response(reason: FailureReason, timeout: Duration, request_id: &str) -> Response {
    match reason {
        FailureReason::NoEligibleSubscription => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded",
            "All subscriptions are at capacity or cooling down. Please retry.",
            request_id,
        ),
        FailureReason::RetriesExhausted => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit",
            "All subscriptions rate limited. Please retry later.",
            request_id,
        ),
        FailureReason::UpstreamTimeout => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            &format!("upstream timeout after {}s", timeout.as_secs()),
            request_id,
        ),
        FailureReason::UpstreamUnreachable => error_response(
            StatusCode::BAD_GATEWAY,
            "proxy_error",
            "upstream unreachable",
            request_id,
        ),
        FailureReason::StreamInterrupted => error_response(
            StatusCode::BAD_GATEWAY,
            "proxy_error",
            "upstream response interrupted",
            request_id,
        ),
        FailureReason::ClientCancelled => error_response(
            StatusCode::BAD_REQUEST,
            "proxy_error",
            "request cancelled",
            request_id,
        ),
    }
}

/// Value of the client-identifying header, or "unknown".
pub fn client_id(headers: &HeaderMap) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(64).collect())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Proxy an inbound request through the subscription pool.
#[instrument(
    skip_all,
    fields(
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        client_id = tracing::field::Empty,
    )
)]
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.in_flight);

    let client = client_id(request.headers());
    tracing::Span::current().record("client_id", client.as_str());

    let method = request.method().clone();
    let url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };
    let headers = relay::upstream_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("invalid request body: {e}"),
                &request_id,
            );
            metrics::record_request(400, method.as_str(), &client, started.elapsed().as_secs_f64());
            return response;
        }
    };

    let streaming_requested = relay::is_streaming_request(&body);
    let upstream = UpstreamRequest {
        method: method.clone(),
        url,
        headers,
        body,
    };

    let mut attempt = RequestAttempt::new(client.clone(), state.max_retries);
    let response = drive(state, &upstream, streaming_requested, &mut attempt, &request_id).await;

    let status = response.status();
    if matches!(attempt.state(), AttemptState::Failed { .. }) {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(
        status.as_u16(),
        method.as_str(),
        &client,
        started.elapsed().as_secs_f64(),
    );
    info!(
        status = status.as_u16(),
        attempts = attempt.attempts(),
        tried = ?attempt.tried(),
        streaming = streaming_requested,
        duration_ms = started.elapsed().as_millis() as u64,
        "request finished"
    );
    response
}

/// Execute state machine actions until a terminal one yields a response.
async fn drive(
    state: &ProxyState,
    upstream: &UpstreamRequest,
    streaming_requested: bool,
    attempt: &mut RequestAttempt,
    request_id: &str,
) -> Response {
    let mut action = attempt.start();
    let mut reservation: Option<Reservation> = None;
    let mut relayed: Option<Response> = None;
    let mut retry_after: Option<Duration> = None;

    loop {
        action = match action {
            AttemptAction::Select => match state.pool.select(attempt.excluded(), Instant::now()) {
                Ok(subscription) => attempt.handle(AttemptEvent::Selected { subscription }),
                Err(e) => {
                    warn!(error = %e, tried = ?attempt.tried(), "no eligible subscription");
                    attempt.handle(AttemptEvent::NoEligibleSubscription)
                }
            },

            AttemptAction::Reserve { subscription } => {
                match state.pool.reserve(&subscription, Instant::now()) {
                    Ok(held) => {
                        reservation = Some(held);
                        attempt.handle(AttemptEvent::Reserved)
                    }
                    Err(PoolError::BurstLimited(_)) => attempt.handle(AttemptEvent::BurstLimited),
                    Err(e) => {
                        debug!(subscription = subscription.as_str(), error = %e, "reservation lost race");
                        attempt.handle(AttemptEvent::CapacityExhausted)
                    }
                }
            }

            AttemptAction::Forward { subscription } => {
                let Some(held) = reservation.take() else {
                    error!(subscription = subscription.as_str(), "forward without reservation");
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "proxy_error",
                        "internal routing error",
                        request_id,
                    );
                };
                let (event, response) =
                    forward(state, upstream, streaming_requested, &subscription, held, attempt)
                        .await;
                if event == AttemptEvent::RateLimited {
                    retry_after = response
                        .as_ref()
                        .and_then(|r| relay::retry_after(r.headers()));
                } else {
                    relayed = response;
                }
                let reason = failover_reason(&event);
                let next = attempt.handle(event);
                if let (Some(reason), AttemptAction::Select) = (reason, &next) {
                    metrics::record_failover(&subscription, reason);
                }
                next
            }

            AttemptAction::Penalize { subscription } => {
                if let Err(e) = state
                    .pool
                    .penalize(&subscription, retry_after.take(), Instant::now())
                {
                    error!(subscription = subscription.as_str(), error = %e, "penalize failed");
                }
                let next = attempt.handle(AttemptEvent::Penalized);
                if next == AttemptAction::Select {
                    metrics::record_failover(&subscription, "rate_limited");
                }
                next
            }

            AttemptAction::Complete => {
                return relayed.take().unwrap_or_else(|| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "proxy_error",
                        "missing upstream response",
                        request_id,
                    )
                });
            }

            AttemptAction::Fail { reason } => {
                warn!(
                    reason = reason.as_str(),
                    attempts = attempt.attempts(),
                    tried = ?attempt.tried(),
                    "request failed"
                );
                return failure_response(reason, state.timeout, request_id);
            }

            AttemptAction::None => {
                error!(state = ?attempt.state(), "failover state machine stalled");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "proxy_error",
                    "internal routing error",
                    request_id,
                );
            }
        };
    }
}

/// Failover label for a transport failure that the state machine may retry.
fn failover_reason(event: &AttemptEvent) -> Option<&'static str> {
    match event {
        AttemptEvent::UpstreamTimeout => Some("timeout"),
        AttemptEvent::UpstreamUnreachable => Some("unreachable"),
        _ => None,
    }
}

/// One upstream attempt. Consumes the reservation: it is released here unless
/// it moves into a streamed response body.
///
/// For a 429 the returned response carries only the upstream headers so the
/// caller can read `Retry-After`.
async fn forward(
    state: &ProxyState,
    upstream: &UpstreamRequest,
    streaming_requested: bool,
    subscription: &str,
    reservation: Reservation,
    attempt: &RequestAttempt,
) -> (AttemptEvent, Option<Response>) {
    debug!(
        subscription,
        attempt = attempt.attempts(),
        scheme = reservation.credential().scheme(),
        "forwarding upstream"
    );

    let upstream_response = match relay::send(
        &state.client,
        upstream,
        reservation.credential(),
        state.timeout,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            drop(reservation);
            return (transport_failure(state, subscription, &e), None);
        }
    };

    let status = upstream_response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let mut head = Response::new(Body::empty());
        *head.headers_mut() = upstream_response.headers().clone();
        drop(upstream_response);
        drop(reservation);
        metrics::record_upstream_error("rate_limited");
        warn!(subscription, reason = "rate_limited", "upstream returned 429");
        return (AttemptEvent::RateLimited, Some(head));
    }

    if status.is_server_error() {
        let _ = state.pool.record_error(subscription);
        metrics::record_upstream_error("server_error");
        warn!(subscription, status = status.as_u16(), "upstream server error, relaying");
    }

    if streaming_requested || relay::is_event_stream(upstream_response.headers()) {
        let response = relay::stream_response(upstream_response, reservation, state.pool.clone());
        return (AttemptEvent::Completed, Some(response));
    }

    let buffered = relay::buffer_response(upstream_response, state.timeout).await;
    drop(reservation);
    match buffered {
        Ok(response) => (AttemptEvent::Completed, Some(response)),
        Err(e) => (transport_failure(state, subscription, &e), None),
    }
}

/// Count and log a failed attempt, and classify it for the state machine.
fn transport_failure(state: &ProxyState, subscription: &str, e: &ForwardError) -> AttemptEvent {
    let _ = state.pool.record_error(subscription);
    metrics::record_upstream_error(e.label());
    match e {
        ForwardError::Timeout(_) => {
            warn!(subscription, error = %e, reason = e.label(), "upstream request failed");
            AttemptEvent::UpstreamTimeout
        }
        ForwardError::Unreachable(_) => {
            warn!(subscription, error = %e, reason = e.label(), "upstream request failed");
            AttemptEvent::UpstreamUnreachable
        }
        ForwardError::Interrupted(_) => {
            error!(subscription, error = %e, reason = e.label(), "failed to read upstream response body");
            AttemptEvent::StreamInterrupted
        }
    }
}
