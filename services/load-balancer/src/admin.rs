//! Admin API for subscription management
//!
//! Runs on a separate listener (`[admin] listen_addr`) so it can stay off the
//! network the proxy is exposed on, and only answers loopback peers. Toggling a subscription is the only runtime
//! change to the configured set; the quota endpoint is where an external quota
//! tracker reports remaining quota.
//!
//! Endpoints:
//! - `GET /admin/subscriptions`: status snapshot
//! - `POST /admin/subscriptions/{name}/enable`: return to rotation
//! - `POST /admin/subscriptions/{name}/disable`: take out of rotation
//! - `PUT /admin/subscriptions/{name}/quota`: set remaining quota fraction

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use subscription_pool::{Error as PoolError, Pool};
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/subscriptions", get(list_subscriptions))
        .route("/admin/subscriptions/{name}/enable", post(enable_subscription))
        .route("/admin/subscriptions/{name}/disable", post(disable_subscription))
        .route("/admin/subscriptions/{name}/quota", put(set_quota))
        .route_layer(middleware::from_fn(require_loopback))
        .with_state(state)
}

/// Reject any request whose peer address is not loopback with 403.
///
/// The peer comes from `ConnectInfo`, so the router must be served with
/// `into_make_service_with_connect_info`. A request without it is rejected.
pub async fn require_loopback(request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    match peer {
        Some(addr) if addr.ip().to_canonical().is_loopback() => next.run(request).await,
        _ => {
            warn!(peer = ?peer, path = %request.uri().path(), "non-local request refused");
            json_response(
                StatusCode::FORBIDDEN,
                serde_json::json!({
                    "error": { "type": "forbidden", "message": "only available from localhost" }
                }),
            )
        }
    }
}

/// Status snapshot plus a unix timestamp, as served on `/status`.
pub fn status_json(pool: &Pool) -> serde_json::Value {
    let report = pool.status(Instant::now());
    let mut body = serde_json::to_value(&report).unwrap_or_else(|_| serde_json::json!({}));
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if let Some(map) = body.as_object_mut() {
        map.insert("timestamp".into(), timestamp.into());
    }
    body
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn pool_error_response(name: &str, error: PoolError) -> Response {
    let status = match error {
        PoolError::UnknownSubscription(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    warn!(subscription = name, error = %error, "admin request rejected");
    json_response(
        status,
        serde_json::json!({ "error": { "type": "admin_error", "message": error.to_string() } }),
    )
}

/// GET /admin/subscriptions
async fn list_subscriptions(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, status_json(&state.pool))
}

async fn enable_subscription(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Response {
    toggle(&state, name, true)
}

async fn disable_subscription(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Response {
    toggle(&state, name, false)
}

fn toggle(state: &AdminState, name: String, enabled: bool) -> Response {
    match state.pool.set_enabled(&name, enabled) {
        Ok(()) => {
            info!(subscription = name, enabled, "subscription toggled via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "subscription": name, "enabled": enabled }),
            )
        }
        Err(e) => pool_error_response(&name, e),
    }
}

#[derive(Debug, Deserialize)]
struct QuotaUpdate {
    /// Fraction of quota left in `[0, 1]`; `null` marks it unknown.
    remaining: Option<f64>,
}

/// PUT /admin/subscriptions/{name}/quota
async fn set_quota(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(update): Json<QuotaUpdate>,
) -> Response {
    match state.pool.set_quota_remaining(&name, update.remaining) {
        Ok(()) => {
            info!(subscription = name, remaining = ?update.remaining, "quota updated");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "subscription": name, "quota_remaining": update.remaining }),
            )
        }
        Err(e) => pool_error_response(&name, e),
    }
}
