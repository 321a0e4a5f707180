//! Anthropic Load Balancer
//!
//! Single-binary Rust service that:
//! 1. Loads a fixed set of subscriptions from TOML
//! 2. Listens for Anthropic API requests
//! 3. Picks the least-loaded subscription that is not cooling down
//! 4. Substitutes that subscription's credential and proxies upstream,
//!    failing over to another subscription on 429

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;
mod relay;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::ProxyState;

/// Grace period for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide counters surfaced on `/health`.
#[derive(Clone)]
struct ServiceMetrics {
    started_at: Instant,
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
}

impl ServiceMetrics {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrent inbound requests; excess requests queue.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/status",
            get(status_handler).layer(axum::middleware::from_fn(admin::require_loopback)),
        )
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("text")) {
        tracing_subscriber::fmt::layer().boxed()
    } else {
        tracing_subscriber::fmt::layer().json().boxed()
    };

    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting anthropic-load-balancer");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        admin_addr = ?config.admin.as_ref().map(|a| a.listen_addr),
        subscriptions = config.descriptors.len(),
        cooldown_secs = config.rate_limit.cooldown_seconds,
        burst_limit = config.rate_limit.burst_limit,
        max_retries = config.routing.max_retries,
        "configuration loaded"
    );

    for descriptor in &config.descriptors {
        info!(
            subscription = descriptor.name.as_str(),
            max_concurrent = descriptor.max_concurrent,
            priority = descriptor.priority,
            enabled = descriptor.enabled,
            scheme = descriptor.credential.scheme(),
            "subscription registered"
        );
    }

    let pool = Arc::new(
        config
            .build_pool()
            .context("failed to build subscription pool")?,
    );

    let timeout = Duration::from_secs(config.proxy.timeout_secs);
    let client = reqwest::Client::builder()
        .read_timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        client,
        upstream_url: config.proxy.upstream_url.clone(),
        timeout,
        pool: pool.clone(),
        max_retries: config.routing.max_retries,
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Admin listener is optional and shares the pool with the proxy
    let admin_handle = match &config.admin {
        Some(admin) => {
            let admin_listener = TcpListener::bind(admin.listen_addr)
                .await
                .with_context(|| format!("failed to bind admin to {}", admin.listen_addr))?;
            let admin_app = admin::build_admin_router(AdminState::new(pool.clone()));
            info!(addr = %admin.listen_addr, "admin API listening");
            Some(tokio::spawn(async move {
                let service = admin_app.into_make_service_with_connect_info::<SocketAddr>();
                if let Err(e) = axum::serve(admin_listener, service).await {
                    error!(error = %e, "admin server error");
                }
            }))
        }
        None => None,
    };

    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();

    // The drain deadline starts when the signal fires, not when the server
    // starts, so the server is told to drain via a oneshot and then raced
    // against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    if let Some(handle) = admin_handle {
        handle.abort();
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness: the process is up and serving. Pool health lives on `/status`.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        admin::status_json(&state.proxy.pool).to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies every other path upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode};
    use subscription_pool::{Credential, Pool, PoolSettings, SubscriptionDescriptor};
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// `(name, credential)` pairs, priority in list order, two slots each.
    fn test_pool(subscriptions: &[(&str, &str)]) -> Arc<Pool> {
        let descriptors = subscriptions
            .iter()
            .enumerate()
            .map(|(i, (name, credential))| SubscriptionDescriptor {
                name: name.to_string(),
                credential: Credential::parse(credential).unwrap(),
                max_concurrent: 2,
                priority: i as u32 + 1,
                enabled: true,
            })
            .collect();
        Arc::new(Pool::new(descriptors, PoolSettings::default()).unwrap())
    }

    fn test_app_state(upstream_url: &str, pool: Arc<Pool>, timeout: Duration) -> AppState {
        let metrics = ServiceMetrics::new();
        AppState {
            proxy: ProxyState {
                client: reqwest::Client::builder()
                    .read_timeout(timeout)
                    .build()
                    .unwrap(),
                upstream_url: upstream_url.to_string(),
                timeout,
                pool,
                max_retries: subscription_pool::DEFAULT_MAX_RETRIES,
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
                in_flight: metrics.in_flight.clone(),
            },
            metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    /// Serve `app` on an ephemeral port and return its base URL.
    async fn start_upstream(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    fn header_json(headers: &HeaderMap) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in headers {
            map.insert(
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
            );
        }
        serde_json::Value::Object(map)
    }

    /// Echoes request headers, path, query and body.
    async fn start_echo_server() -> String {
        let app = Router::new().fallback(|request: Request<Body>| async move {
            let headers = header_json(request.headers());
            let path = request.uri().path().to_string();
            let query = request.uri().query().unwrap_or("").to_string();
            let body = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                .await
                .unwrap();
            axum::Json(serde_json::json!({
                "echoed_headers": headers,
                "path": path,
                "query": query,
                "body": String::from_utf8_lossy(&body),
            }))
        });
        start_upstream(app).await
    }

    /// Answers 429 for requests carrying any of `limited` credentials, echoes
    /// headers otherwise. Counts every request.
    async fn start_rate_limiting_server(
        limited: &'static [&'static str],
        hits: Arc<AtomicU64>,
    ) -> String {
        let app = Router::new().fallback(move |request: Request<Body>| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let key = request
                    .headers()
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if limited.contains(&key.as_str()) {
                    return (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("retry-after", "1")],
                        r#"{"type":"error","error":{"type":"rate_limit_error"}}"#.to_string(),
                    )
                        .into_response();
                }
                axum::Json(serde_json::json!({ "echoed_headers": header_json(request.headers()) }))
                    .into_response()
            }
        });
        start_upstream(app).await
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn messages_request(body: &'static str) -> Request<Body> {
        Request::builder()
            .uri("/v1/messages?beta=true")
            .method("POST")
            .header("content-type", "application/json")
            .header("authorization", "Bearer client-supplied")
            .header("x-client-id", "team-a")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_app_state("http://unused", test_pool(&[("a", "sk-ant-a")]), Duration::from_secs(5));
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["requests_served"], 5);
        assert_eq!(json["errors_total"], 0);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn status_endpoint_reports_pool() {
        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "oauth-b")]);
        pool.set_enabled("b", false).unwrap();
        let app = build_router(test_app_state("http://unused", pool, Duration::from_secs(5)), 1000);

        let mut request = Request::builder().uri("/status").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 41000))));
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["total_capacity"], 2);
        assert_eq!(json["subscriptions"][1]["enabled"], false);
        assert!(json["timestamp"].is_u64());
        assert!(!json.to_string().contains("oauth-b"));
    }

    #[tokio::test]
    async fn status_endpoint_refuses_remote_peers() {
        let pool = test_pool(&[("a", "sk-ant-a")]);
        let app = build_router(test_app_state("http://unused", pool, Duration::from_secs(5)), 1000);

        let mut request = Request::builder().uri("/status").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 41000))));
        let response = app.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "forbidden");
        assert!(json.get("subscriptions").is_none());

        // Health stays open to any peer
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_over_tcp_from_loopback() {
        let pool = test_pool(&[("a", "sk-ant-a")]);
        let proxy_url = start_upstream(build_router(
            test_app_state("http://unused", pool, Duration::from_secs(5)),
            1000,
        ))
        .await;

        let response = reqwest::get(format!("{proxy_url}/status")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
        assert_eq!(json["total_capacity"], 2);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state("http://unused", test_pool(&[("a", "sk-ant-a")]), Duration::from_secs(5));
        let app = build_router(state, 1000);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn proxy_substitutes_api_key_credential() {
        let upstream = start_echo_server().await;
        let state = test_app_state(&upstream, test_pool(&[("a", "sk-ant-api-a")]), Duration::from_secs(5));
        let app = build_router(state, 1000);

        let response = app
            .oneshot(messages_request(r#"{"model":"claude-sonnet-4"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        let headers = &json["echoed_headers"];
        assert_eq!(headers["x-api-key"], "sk-ant-api-a");
        assert!(headers.get("authorization").is_none(), "client auth must not leak");
        assert!(headers.get("x-client-id").is_none());
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(json["path"], "/v1/messages");
        assert_eq!(json["query"], "beta=true");
        assert_eq!(json["body"], r#"{"model":"claude-sonnet-4"}"#);
    }

    #[tokio::test]
    async fn proxy_substitutes_bearer_credential() {
        let upstream = start_echo_server().await;
        let state = test_app_state(&upstream, test_pool(&[("a", "oauth-token-a")]), Duration::from_secs(5));
        let app = build_router(state, 1000);

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        let json = json_body(response).await;
        assert_eq!(json["echoed_headers"]["authorization"], "Bearer oauth-token-a");
        assert!(json["echoed_headers"].get("x-api-key").is_none());
    }

    #[tokio::test]
    async fn rate_limited_subscription_fails_over_and_cools_down() {
        let hits = Arc::new(AtomicU64::new(0));
        let upstream = start_rate_limiting_server(&["sk-ant-a"], hits.clone()).await;
        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b")]);
        let state = test_app_state(&upstream, pool.clone(), Duration::from_secs(5));
        let app = build_router(state, 1000);

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK, "429 must be invisible to the client");
        let json = json_body(response).await;
        assert_eq!(json["echoed_headers"]["x-api-key"], "sk-ant-b");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let report = pool.status(Instant::now());
        assert!(report.subscriptions[0].in_cooldown);
        assert_eq!(report.subscriptions[0].total_errors, 1);
        assert!(!report.subscriptions[1].in_cooldown);
        assert_eq!(report.subscriptions[0].active_connections, 0);
        assert_eq!(report.subscriptions[1].active_connections, 0);
    }

    #[tokio::test]
    async fn all_subscriptions_rate_limited_returns_429() {
        let hits = Arc::new(AtomicU64::new(0));
        let upstream =
            start_rate_limiting_server(&["sk-ant-a", "sk-ant-b", "sk-ant-c"], hits.clone()).await;
        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b"), ("c", "sk-ant-c")]);
        let state = test_app_state(&upstream, pool, Duration::from_secs(5));
        let errors_total = state.proxy.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "rate_limit");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert_eq!(hits.load(Ordering::SeqCst), 3, "first attempt plus two failovers");
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn all_subscriptions_disabled_returns_503() {
        let hits = Arc::new(AtomicU64::new(0));
        let upstream = start_rate_limiting_server(&[], hits.clone()).await;
        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b")]);
        pool.set_enabled("a", false).unwrap();
        pool.set_enabled("b", false).unwrap();
        let app = build_router(test_app_state(&upstream, pool, Duration::from_secs(5)), 1000);

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "overloaded");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_server_error_is_relayed_and_counted() {
        let app_upstream = Router::new().fallback(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                r#"{"type":"error","error":{"type":"api_error"}}"#,
            )
        });
        let upstream = start_upstream(app_upstream).await;
        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b")]);
        let app = build_router(test_app_state(&upstream, pool.clone(), Duration::from_secs(5)), 1000);

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "api_error", "5xx body must pass through verbatim");

        let report = pool.status(Instant::now());
        assert_eq!(report.subscriptions[0].total_errors, 1);
        assert!(!report.subscriptions[0].in_cooldown, "only 429 triggers cooldown");
        assert_eq!(report.subscriptions[1].total_requests, 0, "5xx is not failed over");
    }

    #[tokio::test]
    async fn upstream_timeout_retries_once_then_504() {
        let connections = Arc::new(AtomicU64::new(0));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = format!("http://{}", listener.local_addr().unwrap());
        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });

        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b"), ("c", "sk-ant-c")]);
        let app = build_router(
            test_app_state(&upstream, pool.clone(), Duration::from_millis(50)),
            1000,
        );

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "timeout");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connections.load(Ordering::SeqCst), 2, "one attempt plus one retry");
        let report = pool.status(Instant::now());
        assert_eq!(report.total_active, 0);
        assert!(report.subscriptions.iter().all(|s| !s.in_cooldown));

        // Only the first timeout moved the request elsewhere.
        let rendered = handle.render();
        let failovers: Vec<&str> = rendered
            .lines()
            .filter(|l| l.starts_with("proxy_failovers_total{"))
            .collect();
        assert_eq!(failovers.len(), 1, "got: {rendered}");
        assert!(failovers[0].contains("subscription=\"a\""), "got: {rendered}");
        assert!(failovers[0].contains("reason=\"timeout\""), "got: {rendered}");
        assert!(failovers[0].ends_with(" 1"), "got: {rendered}");
    }

    #[tokio::test]
    async fn stalled_response_body_is_a_timeout() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let upstream_app = Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let stalled =
                    futures_util::stream::pending::<Result<bytes::Bytes, std::convert::Infallible>>();
                (
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    Body::from_stream(stalled),
                )
            }
        });
        let upstream = start_upstream(upstream_app).await;
        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b")]);
        let app = build_router(
            test_app_state(&upstream, pool.clone(), Duration::from_millis(100)),
            1000,
        );

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "timeout");
        assert_eq!(hits.load(Ordering::SeqCst), 2, "the stalled body is retried once");

        let report = pool.status(Instant::now());
        assert_eq!(report.total_active, 0);
        assert_eq!(report.subscriptions[0].total_errors, 1);
        assert_eq!(report.subscriptions[1].total_errors, 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_502() {
        let pool = test_pool(&[("a", "sk-ant-a")]);
        let app = build_router(
            test_app_state("http://127.0.0.1:1", pool, Duration::from_secs(5)),
            1000,
        );

        let response = app.oneshot(messages_request("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let pool = test_pool(&[("a", "sk-ant-a")]);
        let state = test_app_state("http://unused", pool, Duration::from_secs(5));
        let errors_total = state.proxy.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/messages")
                    .method("POST")
                    .body(Body::from(vec![b'x'; 10 * 1024 * 1024 + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    /// SSE upstream that sends `events` then finishes.
    fn sse_upstream(events: &'static [&'static str]) -> Router {
        Router::new().fallback(move || async move {
            let stream = futures_util::stream::iter(
                events
                    .iter()
                    .map(|e| Ok::<_, std::convert::Infallible>(bytes::Bytes::from_static(e.as_bytes()))),
            );
            (
                [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
        })
    }

    #[tokio::test]
    async fn streaming_response_is_relayed_in_order_and_releases_slot() {
        const EVENTS: &[&str] = &[
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
            "event: content_block_delta\ndata: {\"delta\":\"Hel\"}\n\n",
            "event: content_block_delta\ndata: {\"delta\":\"lo\"}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ];
        let upstream = start_upstream(sse_upstream(EVENTS)).await;
        let pool = test_pool(&[("a", "sk-ant-a")]);
        let app = build_router(test_app_state(&upstream, pool.clone(), Duration::from_secs(5)), 1000);

        let response = app
            .oneshot(messages_request(r#"{"stream":true}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(
            pool.connections().active_connections("a").unwrap(),
            1,
            "slot is held while the body is unread"
        );

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&body), EVENTS.concat());
        assert_eq!(pool.connections().active_connections("a").unwrap(), 0);
    }

    #[tokio::test]
    async fn client_disconnect_mid_stream_releases_slot() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let upstream_app = Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let first = futures_util::stream::once(async {
                    Ok::<_, std::convert::Infallible>(bytes::Bytes::from_static(
                        b"event: message_start\ndata: {}\n\n",
                    ))
                });
                // Never finishes on its own
                let rest = futures_util::stream::pending();
                (
                    [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(futures_util::StreamExt::chain(first, rest)),
                )
            }
        });
        let upstream = start_upstream(upstream_app).await;

        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b")]);
        let proxy_url = start_upstream(build_router(
            test_app_state(&upstream, pool.clone(), Duration::from_secs(30)),
            1000,
        ))
        .await;

        let client = reqwest::Client::new();
        let mut response = client
            .post(format!("{proxy_url}/v1/messages"))
            .header("content-type", "application/json")
            .body(r#"{"stream":true}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let first = response.chunk().await.unwrap().unwrap();
        assert!(first.starts_with(b"event: message_start"));
        assert_eq!(pool.connections().active_connections("a").unwrap(), 1);

        drop(response);
        drop(client);

        let deadline = Instant::now() + Duration::from_millis(500);
        while pool.connections().active_connections("a").unwrap() != 0 {
            assert!(Instant::now() < deadline, "slot not released after disconnect");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1, "disconnect must not trigger a retry");
        assert_eq!(pool.connections().active_connections("b").unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_spread_by_load() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let held = gate.clone();
        let upstream_app = Router::new().fallback(move |request: Request<Body>| {
            let held = held.clone();
            async move {
                let _permit = held.acquire().await.unwrap();
                axum::Json(serde_json::json!({ "echoed_headers": header_json(request.headers()) }))
            }
        });
        let upstream = start_upstream(upstream_app).await;
        let pool = test_pool(&[("a", "sk-ant-a"), ("b", "sk-ant-b")]);
        let app = build_router(
            test_app_state(&upstream, pool.clone(), Duration::from_secs(5)),
            1000,
        );

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                app.oneshot(messages_request("{}")).await.unwrap()
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.status(Instant::now()).total_active < 4 {
            assert!(Instant::now() < deadline, "requests never reached upstream");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let report = pool.status(Instant::now());
        assert_eq!(report.subscriptions[0].active_connections, 2);
        assert_eq!(report.subscriptions[1].active_connections, 2);
        assert_eq!(report.status, subscription_pool::PoolHealth::Unhealthy);

        gate.add_permits(4);
        for task in tasks {
            assert_eq!(task.await.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(pool.status(Instant::now()).total_active, 0);
    }
}
