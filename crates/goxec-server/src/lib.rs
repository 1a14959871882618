//! HTTP/WebSocket ingress for the goxec execution engine.
//!
//! This crate is the front door of the pipeline: it admission-checks each
//! submission with a per-address token bucket, appends accepted jobs to the
//! durable stream, and binds execution output back to clients over
//! WebSocket sessions. It owns no execution state: workers touch only the
//! stream and the log bus, and the session registry lives entirely in this
//! process.

pub mod error;
pub mod ratelimit;
pub mod ws;

pub use error::{Result, ServerError};
pub use ratelimit::RateLimiter;
pub use ws::SessionHub;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, Request, State, WebSocketUpgrade};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use goxec_core::{Frame, Job, JobQueue, LogBus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Configuration for the ingress server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Maximum accepted snippet length in bytes
    pub max_code_len: usize,
    /// Token-bucket refill rate, tokens per second
    pub rate: f64,
    /// Token-bucket burst capacity
    pub capacity: f64,
    /// How often the bucket reaper runs
    pub cleanup_interval: Duration,
    /// Bucket idle time before the reaper deletes it
    pub visitor_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static bind address"),
            max_code_len: 64 * 1024,
            rate: 0.5,
            capacity: 5.0,
            cleanup_interval: Duration::from_secs(60),
            visitor_timeout: Duration::from_secs(180),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    /// Set the maximum snippet length.
    pub fn with_max_code_len(mut self, len: usize) -> Self {
        self.max_code_len = len;
        self
    }

    /// Set admission rate and burst capacity.
    pub fn with_admission(mut self, rate: f64, capacity: f64) -> Self {
        self.rate = rate;
        self.capacity = capacity;
        self
    }

    /// Set the reaper cadence and bucket idle timeout.
    pub fn with_reaper(mut self, cleanup_interval: Duration, visitor_timeout: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self.visitor_timeout = visitor_timeout;
        self
    }
}

/// Shared application state threaded through the router.
#[derive(Clone)]
pub struct AppState {
    queue: Arc<dyn JobQueue>,
    hub: Arc<SessionHub>,
    limiter: Arc<RateLimiter>,
    config: ServerConfig,
}

#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    code: String,
    #[serde(default)]
    language: String,
}

#[derive(Deserialize)]
struct WsParams {
    #[serde(default)]
    job_id: String,
}

/// Handler for the `POST /api/run` endpoint.
async fn submit_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if req.code.is_empty() || req.language.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "code and language are required"})),
        ));
    }
    if req.code.len() > state.config.max_code_len {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "code exceeds maximum length"})),
        ));
    }

    let job_id = Uuid::new_v4().to_string();
    let job = Job::new(job_id.clone(), req.code, req.language);

    log::info!("Received submission {}", job_id);
    match state.queue.publish(&job).await {
        Ok(entry_id) => {
            log::debug!("Job {} appended as stream entry {}", job_id, entry_id);
            Ok(Json(json!({"job_id": job_id, "status": "queued"})))
        }
        Err(e) => {
            log::error!("Failed to publish job {}: {}", job_id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to enqueue job"})),
            ))
        }
    }
}

/// Handler for the `GET /api/ws` session upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if params.job_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "job_id is required"})),
        )
            .into_response();
    }
    let hub = state.hub.clone();
    upgrade.on_upgrade(move |socket| ws::serve_session(socket, hub, params.job_id))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Token-bucket admission gate applied to the submit route.
async fn admission_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let addr = client_addr(&request);
    if !state.limiter.allow(&addr) {
        log::warn!("Admission denied for {}", addr);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Too Many Requests"})),
        )
            .into_response();
    }
    next.run(request).await
}

/// Remote address for admission, preferring the forwarding header set by
/// the front proxy.
fn client_addr(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The ingress API server.
pub struct ApiServer {
    queue: Arc<dyn JobQueue>,
    bus: Arc<dyn LogBus>,
    hub: Arc<SessionHub>,
    limiter: Arc<RateLimiter>,
    config: ServerConfig,
}

impl ApiServer {
    /// Create a server with the default configuration.
    pub fn new(queue: Arc<dyn JobQueue>, bus: Arc<dyn LogBus>) -> Self {
        Self::with_config(queue, bus, ServerConfig::default())
    }

    /// Create a server with custom configuration.
    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        bus: Arc<dyn LogBus>,
        config: ServerConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate, config.capacity));
        Self {
            queue,
            bus,
            hub: Arc::new(SessionHub::new()),
            limiter,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> Arc<SessionHub> {
        self.hub.clone()
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            queue: self.queue.clone(),
            hub: self.hub.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
        };

        let admitted = Router::new()
            .route("/api/run", post(submit_handler))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                admission_middleware,
            ));

        Router::new()
            .merge(admitted)
            .route("/api/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE]),
            )
    }

    /// Start the server with graceful shutdown support.
    ///
    /// Fails fast if the log bus cannot be subscribed, since without the pump
    /// the server would accept jobs whose output no session can observe.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let frames = self.bus.subscribe_logs().await?;
        tokio::spawn(run_log_pump(frames, self.hub.clone()));
        self.limiter
            .spawn_reaper(self.config.cleanup_interval, self.config.visitor_timeout);

        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            ServerError::config_error(format!(
                "Failed to bind to {}: {}",
                self.config.bind_addr, e
            ))
        })?;

        log::info!("goxec API server listening on {}", self.config.bind_addr);
        log::info!("Submit endpoint: http://{}/api/run", self.config.bind_addr);
        log::info!("Session endpoint: ws://{}/api/ws", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal)
        .await?;

        log::info!("goxec API server shut down gracefully");
        Ok(())
    }
}

/// Forward every log-bus frame to the session registered for its job.
pub async fn run_log_pump(mut frames: mpsc::Receiver<Frame>, hub: Arc<SessionHub>) {
    log::info!("Log pump started");
    while let Some(frame) = frames.recv().await {
        hub.dispatch(&frame).await;
    }
    log::warn!("Log bus subscription ended, pump stopping");
}

/// Utility function to create a shutdown signal from Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use goxec_core::{InMemoryLogBus, InMemoryQueue};
    use tower::ServiceExt; // for `oneshot`

    fn test_server() -> (ApiServer, InMemoryQueue) {
        let queue = InMemoryQueue::new();
        let bus = InMemoryLogBus::new();
        let server = ApiServer::new(Arc::new(queue.clone()), Arc::new(bus));
        (server, queue)
    }

    fn submit_request(body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/api/run")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_queues_job() {
        let (server, queue) = test_server();
        let app = server.build_router();

        let response = app
            .oneshot(submit_request(
                r#"{"code": "print('hi')", "language": "python"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "queued");
        assert!(body["job_id"].as_str().is_some());

        assert_eq!(queue.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_fields() {
        let (server, queue) = test_server();
        let app = server.build_router();

        let response = app
            .clone()
            .oneshot(submit_request(r#"{"code": "print('hi')"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(submit_request(r#"{"language": "python"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_oversized_code() {
        let queue = InMemoryQueue::new();
        let bus = InMemoryLogBus::new();
        let config = ServerConfig::default().with_max_code_len(16);
        let server = ApiServer::with_config(Arc::new(queue.clone()), Arc::new(bus), config);
        let app = server.build_router();

        let response = app
            .oneshot(submit_request(
                r#"{"code": "this snippet is far too long", "language": "python"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_admission_allows_burst_then_rejects() {
        let (server, _queue) = test_server();
        let app = server.build_router();

        for i in 0..5 {
            let response = app
                .clone()
                .oneshot(submit_request(r#"{"code": "1", "language": "python"}"#))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {}", i);
        }

        let response = app
            .oneshot(submit_request(r#"{"code": "1", "language": "python"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_admission_is_per_address() {
        let (server, _queue) = test_server();
        let app = server.build_router();

        for _ in 0..5 {
            app.clone()
                .oneshot(submit_request(r#"{"code": "1", "language": "python"}"#))
                .await
                .unwrap();
        }

        let other = HttpRequest::builder()
            .method("POST")
            .uri("/api/run")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "198.51.100.1")
            .body(Body::from(r#"{"code": "1", "language": "python"}"#))
            .unwrap();
        let response = app.oneshot(other).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_preflight_is_not_admission_checked() {
        let (server, _queue) = test_server();
        let app = server.build_router();

        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/api/run")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn test_ws_requires_job_id() {
        let (server, _queue) = test_server();
        let app = server.build_router();

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri("/api/ws")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri("/api/ws?job_id=")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (server, _queue) = test_server();
        let app = server.build_router();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pump_forwards_frames_to_sessions() {
        let queue = InMemoryQueue::new();
        let bus = InMemoryLogBus::new();
        let server = ApiServer::new(Arc::new(queue), Arc::new(bus.clone()));
        let hub = server.hub();

        let frames = bus.subscribe_logs().await.unwrap();
        tokio::spawn(run_log_pump(frames, hub.clone()));

        let mut session = hub.register("job-1").await;
        bus.broadcast(&Frame::log("job-1", "hello")).await.unwrap();
        bus.broadcast(&Frame::log("job-2", "unrelated")).await.unwrap();

        let frame = session.recv().await.unwrap();
        assert_eq!(frame.job_id(), "job-1");
        assert!(session.try_recv().is_err());
    }
}
