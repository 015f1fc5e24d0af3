//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Upstream**: frames received, parse failures, reconnects, connection gauge
//! - **Downstream**: connections, RPC requests, notifications sent
//! - **Subscriptions**: instruments with an open upstream subscription
//! - **Latency**: trade fan-out time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            #[allow(clippy::expect_used)]
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "trade_gateway_upstream_frames_total",
        "Frames received from the upstream feed by kind"
    );
    describe_counter!(
        "trade_gateway_parse_failures_total",
        "Frames dropped because they could not be decoded"
    );
    describe_counter!(
        "trade_gateway_upstream_reconnects_total",
        "Upstream connection losses followed by a reconnect"
    );
    describe_gauge!(
        "trade_gateway_upstream_connected",
        "1 when the upstream feed is connected"
    );

    describe_gauge!(
        "trade_gateway_downstream_connections",
        "Open downstream WebSocket connections"
    );
    describe_gauge!(
        "trade_gateway_active_instruments",
        "Instruments with an open upstream subscription"
    );
    describe_counter!(
        "trade_gateway_notifications_sent_total",
        "Notifications delivered to downstream connections"
    );
    describe_counter!(
        "trade_gateway_rpc_requests_total",
        "Downstream RPC requests by method and outcome"
    );

    describe_histogram!(
        "trade_gateway_trade_fanout_seconds",
        "Time to fan a trade out to its instrument group"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Upstream frame kinds.
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    /// Trade update.
    Trade,
    /// Subscription acknowledgement.
    Ack,
    /// Rejection.
    Rejected,
    /// Anything else that decoded.
    Other,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Ack => "ack",
            Self::Rejected => "rejected",
            Self::Other => "other",
        }
    }
}

/// Which side of the gateway a malformed frame came from.
#[derive(Debug, Clone, Copy)]
pub enum ParseSide {
    /// Upstream feed.
    Upstream,
    /// Downstream client.
    Downstream,
}

impl ParseSide {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }
}

/// Outcome of a downstream RPC request.
#[derive(Debug, Clone, Copy)]
pub enum RpcOutcome {
    /// Answered with a result.
    Ok,
    /// Answered with an error.
    Error,
}

impl RpcOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from the upstream feed.
pub fn record_upstream_frame(kind: FrameKind) {
    counter!(
        "trade_gateway_upstream_frames_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a frame dropped by the decoder.
pub fn record_parse_failure(side: ParseSide) {
    counter!(
        "trade_gateway_parse_failures_total",
        "side" => side.as_str()
    )
    .increment(1);
}

/// Record an upstream connection loss.
pub fn record_upstream_reconnect() {
    counter!("trade_gateway_upstream_reconnects_total").increment(1);
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("trade_gateway_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the downstream connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_downstream_connections(count: usize) {
    gauge!("trade_gateway_downstream_connections").set(count as f64);
}

/// Update the number of instruments subscribed upstream.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_instruments(count: usize) {
    gauge!("trade_gateway_active_instruments").set(count as f64);
}

/// Record notifications delivered for `method`.
pub fn record_notifications_sent(method: &'static str, count: usize) {
    counter!(
        "trade_gateway_notifications_sent_total",
        "method" => method
    )
    .increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Record a handled downstream RPC request.
pub fn record_rpc_request(method: &str, outcome: RpcOutcome) {
    counter!(
        "trade_gateway_rpc_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record how long one trade fan-out took.
pub fn record_fanout_duration(duration: Duration) {
    histogram!("trade_gateway_trade_fanout_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_as_str() {
        assert_eq!(FrameKind::Trade.as_str(), "trade");
        assert_eq!(FrameKind::Ack.as_str(), "ack");
        assert_eq!(FrameKind::Rejected.as_str(), "rejected");
        assert_eq!(FrameKind::Other.as_str(), "other");
    }

    #[test]
    fn label_enums_as_str() {
        assert_eq!(ParseSide::Upstream.as_str(), "upstream");
        assert_eq!(ParseSide::Downstream.as_str(), "downstream");
        assert_eq!(RpcOutcome::Ok.as_str(), "ok");
        assert_eq!(RpcOutcome::Error.as_str(), "error");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_upstream_frame(FrameKind::Trade);
        record_parse_failure(ParseSide::Downstream);
        set_upstream_connected(true);
        record_rpc_request("subscribe", RpcOutcome::Ok);
        record_fanout_duration(Duration::from_micros(5));
    }
}
