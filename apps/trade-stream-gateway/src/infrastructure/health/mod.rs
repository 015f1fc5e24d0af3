//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, upstream status reporting, Prometheus
//! metrics and recent-trade lookups.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (upstream connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /trades/{symbol}?count=N` - Recent trades, newest first

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::ports::DEFAULT_RECENT_COUNT;
use crate::application::services::TradeDataService;
use crate::domain::streaming::{ConnectionState, Instrument};
use crate::infrastructure::broadcast::ConnectionHub;
use crate::infrastructure::cache::RecentTradeCache;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed status.
    pub upstream: UpstreamInfo,
    /// Connected downstream clients.
    pub connections: usize,
    /// Reference count per subscribed instrument.
    pub subscriptions: BTreeMap<String, usize>,
    /// Trades held in the recent-trade cache.
    pub cached_trades: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream connected.
    Healthy,
    /// Upstream connecting or reconnecting.
    Degraded,
    /// Upstream disconnected.
    Unhealthy,
}

/// Upstream connection status.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    /// Connection state.
    pub state: ConnectionState,
    /// Whether the feed is connected.
    pub connected: bool,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    upstream_state: watch::Receiver<ConnectionState>,
    service: Arc<TradeDataService>,
    hub: Arc<ConnectionHub>,
    cache: Arc<RecentTradeCache>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        upstream_state: watch::Receiver<ConnectionState>,
        service: Arc<TradeDataService>,
        hub: Arc<ConnectionHub>,
        cache: Arc<RecentTradeCache>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            upstream_state,
            service,
            hub,
            cache,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Router with every health endpoint.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/trades/{symbol}", get(recent_trades_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.upstream_state.borrow().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

#[derive(Debug, Deserialize)]
struct RecentTradesQuery {
    count: Option<usize>,
}

async fn recent_trades_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(symbol): Path<String>,
    Query(query): Query<RecentTradesQuery>,
) -> impl IntoResponse {
    let Ok(instrument) = symbol.parse::<Instrument>() else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Invalid symbol: {symbol}") })),
        );
    };

    let count = query.count.unwrap_or(DEFAULT_RECENT_COUNT);
    let trades = state.service.get_recent_trades(instrument, count);
    (StatusCode::OK, Json(serde_json::json!(trades)))
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let upstream_state = *state.upstream_state.borrow();
    let stats = state.service.multiplexer().stats();

    HealthResponse {
        status: determine_health_status(upstream_state),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream: UpstreamInfo {
            state: upstream_state,
            connected: upstream_state.is_connected(),
        },
        connections: state.hub.connection_count(),
        subscriptions: stats
            .per_instrument
            .into_iter()
            .map(|(instrument, count)| (instrument.as_str().to_string(), count))
            .collect(),
        cached_trades: state.cache.total_len(),
    }
}

const fn determine_health_status(state: ConnectionState) -> HealthStatus {
    match state {
        ConnectionState::Connected => HealthStatus::Healthy,
        ConnectionState::Connecting | ConnectionState::Reconnecting => HealthStatus::Degraded,
        ConnectionState::Disconnected => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
