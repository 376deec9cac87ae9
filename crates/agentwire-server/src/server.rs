//! `AgentServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::context::ServerContext;
use crate::health::{self, HealthResponse};
use crate::metrics::{RATE_LIMITED_TOTAL, WS_CONNECTIONS_REJECTED_TOTAL};
use crate::ratelimit::Scope;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::websocket::connection::{CloseReason, ConnectionInfo};
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection-wide context.
    pub ctx: Arc<ServerContext>,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The agentwire server.
pub struct AgentServer {
    ctx: Arc<ServerContext>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl AgentServer {
    /// Create a server around `ctx`.
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            metrics: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            ctx: Arc::clone(&self.ctx),
            metrics: self.metrics.clone(),
        };
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route(&self.ctx.config.ws_path, get(ws_handler));
        if self.metrics.is_some() {
            router = router.route("/metrics", get(metrics_handler));
        }
        router.with_state(state).layer(TraceLayer::new_for_http())
    }

    /// Bind the listener, start the heartbeat sweep, and serve in the
    /// background.
    pub async fn listen(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.ctx.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let token = self.shutdown.token();

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&self.ctx.registry),
            Arc::clone(&self.ctx.limiter),
            Arc::clone(&self.ctx.sessions),
            Arc::clone(&self.ctx.streaming),
            Arc::clone(&self.ctx.audit),
            self.ctx.config.heartbeat_interval,
            self.ctx.config.idle_timeout,
        );
        self.shutdown.track(tokio::spawn(monitor.run(token.clone())));

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        self.shutdown.track(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "server error");
            }
        }));

        info!(%addr, path = %self.ctx.config.ws_path, "agentwire server listening");
        Ok(ServerHandle {
            addr,
            ctx: self.ctx,
            shutdown: self.shutdown,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ServerHandle {
    /// Bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Close every connection with a shutdown notice, wait up to `timeout`
    /// for them to drain, then stop the listener and heartbeat.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownReport {
        let report = self.shutdown.shutdown(&self.ctx.registry, timeout).await;
        info!(?report, "server stopped");
        report
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ctx = &state.ctx;
    Json(health::health_check(
        ctx.start_time,
        &ctx.registry.stats(),
        ctx.sessions.len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET on the WebSocket path. The per-IP connection budget is charged
/// before the upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)), |info| info.0);

    let ip = remote_addr.ip().to_string();
    if let Err(limited) = state.ctx.limiter.check(Scope::ConnectionByIp, &ip, 1) {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => "rate_limited").increment(1);
        counter!(RATE_LIMITED_TOTAL, "scope" => limited.scope.as_str()).increment(1);
        warn!(%remote_addr, retry_after_ms = limited.retry_after_ms(), "connection rate limited");
        let retry_after_secs = limited.retry_after_ms().div_ceil(1000).max(1);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            "Too many connection attempts",
        )
            .into_response();
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let info = ConnectionInfo {
        remote_addr,
        user_agent,
    };
    // Leave headroom above the protocol limit so oversize messages get an
    // INVALID_FORMAT reply instead of a transport error.
    let max_frame = state
        .ctx
        .config
        .validation
        .max_message_bytes
        .saturating_mul(4);
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state.ctx, info))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<ServerContext>, info: ConnectionInfo) {
    match ctx.registry.register(info) {
        Ok((conn, rx)) => run_ws_session(socket, ctx, conn, rx).await,
        Err(e) => {
            warn!(error = %e, "connection refused");
            counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
            let reason = CloseReason::CapacityExceeded;
            let close = WsMessage::Close(Some(CloseFrame {
                code: reason.close_code(),
                reason: reason.close_text().to_owned().into(),
            }));
            let _ = socket.send(close).await;
        }
    }
}
