#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::new_ret_no_self
    )
)]

//! Trade Stream Gateway - Market Data Multiplexer
//!
//! Keeps a single WebSocket connection to an upstream trade feed and fans
//! trades out to any number of downstream JSON-RPC 2.0 clients, opening at
//! most one upstream subscription per instrument.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `streaming`: trade events, wire enumerations, connection state
//!   - `subscription`: reference-count multiplexer
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: upstream feed and trade repository contracts
//!   - `services`: the trade data orchestrator
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `retry` / `transport` / `upstream`: resilient upstream connection
//!   - `cache`: recent-trade store
//!   - `rpc`: JSON-RPC messages and the client-side engine
//!   - `broadcast` / `gateway`: downstream fan-out and WebSocket server
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐     ┌──────────────┐     ┌────────────┐
//! Upstream feed ────►│  Connector   │────►│ Orchestrator │────►│ Dispatcher │──► Client 1
//!  (one socket)      │ (reconnects) │     │ cache + refs │     │  fan-out   │──► Client 2
//!                    └──────────────┘     └──────────────┘     └────────────┘──► Client N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{
    Channel, ConnectionState, EventKind, Instrument, Side, SubscriptionAck, TradeEvent,
};
pub use domain::subscription::{SubscriptionMultiplexer, SubscriptionStats};

// Application
pub use application::ports::{FeedError, FeedEvent, TradeFeed, TradeRepository};
pub use application::services::{ServiceError, ServiceEvent, TradeDataService};

// Upstream
pub use infrastructure::retry::{
    BackoffConfig, BackoffError, BackoffKind, BackoffStrategy, RetryExecutor,
};
pub use infrastructure::transport::{FrameTransport, WebSocketTransport};
pub use infrastructure::upstream::{UpstreamConfig, UpstreamConnector};

// Cache
pub use infrastructure::cache::RecentTradeCache;

// Downstream gateway (for integration tests)
pub use infrastructure::broadcast::{ConnectionHub, ConnectionId};
pub use infrastructure::gateway::{Dispatcher, GatewayServer, GatewayServerError};

// JSON-RPC client
pub use infrastructure::rpc::{
    RpcClientError, RpcConnection, RpcEngine, TradeStreamClient, WsRpcConnection,
};

// Infrastructure config
pub use infrastructure::config::{ClientConfig, ConfigError, GatewayConfig, ServerSettings};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
