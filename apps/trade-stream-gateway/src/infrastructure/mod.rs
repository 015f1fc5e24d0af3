//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, the downstream
//! gateway surface and the ambient services around them.

/// Backoff schedules and the cancellable retry loop.
pub mod retry;

/// Text-frame transports and the single-writer task.
pub mod transport;

/// Upstream trade feed connector and wire codec.
pub mod upstream;

/// Recent-trade cache.
pub mod cache;

/// JSON-RPC messages, client engine and client connection.
pub mod rpc;

/// Downstream connection registry and fan-out groups.
pub mod broadcast;

/// Downstream WebSocket server and request dispatcher.
pub mod gateway;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
