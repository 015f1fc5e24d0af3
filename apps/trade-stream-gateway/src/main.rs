//! Trade Stream Gateway Binary
//!
//! Starts the market data gateway.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trade-stream-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `UPSTREAM_URL`: upstream trade feed WebSocket URL
//!
//! ## Optional
//! - `UPSTREAM_TOKEN`: auth token attached to subscription requests
//! - `BACKOFF_STRATEGY`: exponential | linear (default: exponential)
//! - `BACKOFF_INITIAL_DELAY_MS` / `BACKOFF_MAX_DELAY_MS` (default: 1000 / 30000)
//! - `BACKOFF_MULTIPLIER` / `BACKOFF_INCREMENT_MS` (default: 2.0 / 1000)
//! - `GATEWAY_PORT`: downstream WebSocket port (default: 8080)
//! - `GATEWAY_HEALTH_PORT`: health check HTTP port (default: 8082)
//! - `GATEWAY_EVENT_CAPACITY`: event channel capacity (default: 1024)
//! - `OTEL_ENABLED`: enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: service name (default: trade-stream-gateway)
//! - `RUST_LOG`: log filter (default: `trade_stream_gateway=info`)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use trade_stream_gateway::infrastructure::telemetry;
use trade_stream_gateway::{
    ConnectionHub, Dispatcher, GatewayConfig, GatewayServer, HealthServer, HealthServerState,
    RecentTradeCache, SubscriptionMultiplexer, TradeDataService, TradeFeed, UpstreamConnector,
    WebSocketTransport, init_metrics,
};

/// Upper bound for draining tasks after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Trade Stream Gateway");

    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Upstream side
    let connector = UpstreamConnector::new(
        config.upstream_config(),
        Arc::new(WebSocketTransport),
        config.backoff.build()?,
    );
    let upstream_state = connector.state_changes();
    let feed: Arc<dyn TradeFeed> = Arc::new(connector);

    // Orchestrator
    let cache = Arc::new(RecentTradeCache::new());
    let service = Arc::new(TradeDataService::new(
        feed,
        Arc::new(SubscriptionMultiplexer::new()),
        Arc::clone(&cache) as _,
        config.event_capacity,
    ));

    // Downstream side; the broadcaster subscribes before the feed starts
    let hub = Arc::new(ConnectionHub::new());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&service), Arc::clone(&hub)));
    let broadcaster = dispatcher.spawn_broadcaster(shutdown_token.clone());

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        upstream_state,
        Arc::clone(&service),
        Arc::clone(&hub),
        cache,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let gateway_server = GatewayServer::new(
        config.server.gateway_port,
        Arc::clone(&dispatcher),
        shutdown_token.clone(),
    );
    let gateway_task = tokio::spawn(async move {
        if let Err(e) = gateway_server.run().await {
            tracing::error!(error = %e, "Gateway server error");
        }
    });

    // Connecting retries until it succeeds or shutdown is requested
    let start_service = Arc::clone(&service);
    let start_token = shutdown_token.clone();
    tokio::spawn(async move {
        match start_service.start(&start_token).await {
            Ok(()) => tracing::info!("Trade stream gateway ready"),
            Err(e) => tracing::warn!(error = %e, "Upstream feed not started"),
        }
    });

    await_shutdown(shutdown_token).await;

    let drain = async {
        if let Err(e) = service.stop().await {
            tracing::warn!(error = %e, "Failed to stop trade data service");
        }
        let _ = tokio::join!(broadcaster, gateway_task, health_task);
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Trade stream gateway stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        upstream_url = %config.upstream.url,
        token = config.upstream.token.is_some(),
        gateway_port = config.server.gateway_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        strategy = config.backoff.kind.as_str(),
        initial_delay_ms = config.backoff.initial_delay.as_millis(),
        max_delay_ms = config.backoff.max_delay.as_millis(),
        event_capacity = config.event_capacity,
        "Reconnect settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
