//! Fan-out Dispatcher
//!
//! Handles JSON-RPC requests from downstream connections and pushes
//! orchestrator events out to them.
//!
//! # Requests
//!
//! `subscribe` / `unsubscribe` with `{channel: "trades", symbol}`. Method and
//! channel names are matched case-insensitively; symbols are exact.
//!
//! # Notifications
//!
//! - `trades.update` to the instrument's group
//! - `connection.lost` / `connection.restored` to every connection

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ServiceEvent, TradeDataService};
use crate::domain::streaming::{Channel, EventKind, Instrument, TradeEvent};
use crate::infrastructure::broadcast::{ConnectionId, ConnectionHub};
use crate::infrastructure::metrics::{self, ParseSide, RpcOutcome};
use crate::infrastructure::rpc::messages::{
    CONNECTION_LOST, CONNECTION_RESTORED, ConnectionLostParams, ConnectionRestoredParams,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE,
    RpcError, SubscriptionParams, SubscriptionResult, TRADES_UPDATE,
};

const CONNECTION_LOST_REASON: &str = "Connection to upstream trade feed was lost";

/// Downstream request handler and event broadcaster.
pub struct Dispatcher {
    service: Arc<TradeDataService>,
    hub: Arc<ConnectionHub>,
}

impl Dispatcher {
    /// Create a dispatcher over `service` and `hub`.
    #[must_use]
    pub const fn new(service: Arc<TradeDataService>, hub: Arc<ConnectionHub>) -> Self {
        Self { service, hub }
    }

    /// The connection hub.
    #[must_use]
    pub const fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// The orchestrator.
    #[must_use]
    pub const fn service(&self) -> &Arc<TradeDataService> {
        &self.service
    }

    /// Handle one inbound text frame from `connection` and build the reply.
    pub async fn handle_frame(&self, connection: ConnectionId, text: &str) -> JsonRpcResponse {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            metrics::record_parse_failure(ParseSide::Downstream);
            tracing::debug!(connection_id = %connection, "Unparseable JSON-RPC frame");
            return JsonRpcResponse::failure(Value::Null, RpcError::parse_error());
        };

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request = match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) if request.is_valid() => request,
            _ => {
                tracing::debug!(connection_id = %connection, "Invalid JSON-RPC request");
                return JsonRpcResponse::failure(id, RpcError::invalid_request());
            }
        };

        let method = request.method.to_lowercase();
        let (label, outcome) = match method.as_str() {
            METHOD_SUBSCRIBE => (
                METHOD_SUBSCRIBE,
                self.subscribe(connection, request.params).await,
            ),
            METHOD_UNSUBSCRIBE => (
                METHOD_UNSUBSCRIBE,
                self.unsubscribe(connection, request.params).await,
            ),
            _ => ("unknown", Err(RpcError::method_not_found())),
        };

        match outcome {
            Ok(result) => {
                metrics::record_rpc_request(label, RpcOutcome::Ok);
                JsonRpcResponse::success(request.id, result)
            }
            Err(error) => {
                metrics::record_rpc_request(label, RpcOutcome::Error);
                JsonRpcResponse::failure(request.id, error)
            }
        }
    }

    async fn subscribe(
        &self,
        connection: ConnectionId,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let instrument = validate(params)?;

        if self.hub.is_member(connection, instrument) {
            tracing::debug!(connection_id = %connection, instrument = %instrument, "Already subscribed");
            return encode_result(instrument, EventKind::Subscribed);
        }

        if let Err(e) = self.service.subscribe_to_trades(instrument).await {
            tracing::error!(connection_id = %connection, instrument = %instrument, error = %e, "Failed to subscribe to trades");
            return Err(RpcError::internal_error(e.to_string()));
        }

        if !self.hub.join(connection, instrument) {
            // Connection went away while subscribing; give the share back
            if let Err(e) = self.service.unsubscribe_from_trades(instrument).await {
                tracing::warn!(instrument = %instrument, error = %e, "Failed to release subscription");
            }
            return Err(RpcError::internal_error("connection closed"));
        }

        metrics::set_active_instruments(self.service.multiplexer().active_instruments().len());
        tracing::info!(connection_id = %connection, instrument = %instrument, "Client subscribed to trades");
        encode_result(instrument, EventKind::Subscribed)
    }

    async fn unsubscribe(
        &self,
        connection: ConnectionId,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let instrument = validate(params)?;

        if self.hub.leave(connection, instrument) {
            if let Err(e) = self.service.unsubscribe_from_trades(instrument).await {
                tracing::error!(connection_id = %connection, instrument = %instrument, error = %e, "Failed to unsubscribe from trades");
                return Err(RpcError::internal_error(e.to_string()));
            }
            metrics::set_active_instruments(self.service.multiplexer().active_instruments().len());
            tracing::info!(connection_id = %connection, instrument = %instrument, "Client unsubscribed from trades");
        }

        encode_result(instrument, EventKind::Unsubscribed)
    }

    /// Release every subscription held by `connection` and forget it.
    pub async fn connection_closed(&self, connection: ConnectionId) {
        let instruments = self.hub.unregister(connection);
        for instrument in instruments {
            if let Err(e) = self.service.unsubscribe_from_trades(instrument).await {
                tracing::warn!(connection_id = %connection, instrument = %instrument, error = %e, "Failed to release subscription");
            }
        }

        metrics::set_downstream_connections(self.hub.connection_count());
        metrics::set_active_instruments(self.service.multiplexer().active_instruments().len());
        tracing::info!(connection_id = %connection, "Client disconnected");
    }

    /// Start forwarding orchestrator events to connections.
    ///
    /// Subscribes to the orchestrator before returning, so events raised
    /// after this call are never missed.
    #[must_use]
    pub fn spawn_broadcaster(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = self.service.events();
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.broadcast_events(rx, cancel).await })
    }

    async fn broadcast_events(
        &self,
        mut rx: broadcast::Receiver<ServiceEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = rx.recv() => received,
            };

            match received {
                Ok(ServiceEvent::Trade(trade)) => self.broadcast_trade(&trade),
                Ok(ServiceEvent::ConnectionLost) => {
                    let sent = self.broadcast_all(
                        CONNECTION_LOST,
                        &ConnectionLostParams {
                            reason: CONNECTION_LOST_REASON.to_string(),
                        },
                    );
                    tracing::warn!(connections = sent, "Notified clients of upstream connection loss");
                }
                Ok(ServiceEvent::ConnectionRestored) => {
                    let sent = self.broadcast_all(
                        CONNECTION_RESTORED,
                        &ConnectionRestoredParams {
                            action: "resubscribe".to_string(),
                        },
                    );
                    tracing::info!(connections = sent, "Notified clients of upstream restoration");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Broadcaster lagged behind trade events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("Broadcaster stopped");
    }

    fn broadcast_trade(&self, trade: &TradeEvent) {
        let started = Instant::now();
        let Some(frame) = notification_frame(TRADES_UPDATE, trade) else {
            return;
        };

        let sent = self.hub.send_to_group(trade.instrument, &frame);
        metrics::record_notifications_sent(TRADES_UPDATE, sent);
        metrics::record_fanout_duration(started.elapsed());
        tracing::trace!(instrument = %trade.instrument, trade_id = %trade.trade_id, connections = sent, "Trade fanned out");
    }

    fn broadcast_all<P: Serialize>(&self, method: &'static str, params: &P) -> usize {
        let Some(frame) = notification_frame(method, params) else {
            return 0;
        };
        let sent = self.hub.send_to_all(&frame);
        metrics::record_notifications_sent(method, sent);
        sent
    }
}

/// Validate subscription params and resolve the instrument.
fn validate(params: Option<Value>) -> Result<Instrument, RpcError> {
    let params: SubscriptionParams = params
        .and_then(|p| serde_json::from_value(p).ok())
        .unwrap_or_default();

    let channel_ok = params
        .channel
        .as_deref()
        .is_some_and(|c| c.eq_ignore_ascii_case(Channel::Trades.as_str()));
    if !channel_ok {
        return Err(RpcError::invalid_params("Only 'trades' channel is supported"));
    }

    let symbol = params
        .symbol
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RpcError::invalid_params("Symbol is required"))?;

    symbol
        .parse()
        .map_err(|_| RpcError::invalid_params(format!("Invalid symbol: {symbol}")))
}

fn encode_result(instrument: Instrument, event: EventKind) -> Result<Value, RpcError> {
    serde_json::to_value(SubscriptionResult {
        channel: Channel::Trades,
        instrument,
        event,
    })
    .map_err(|e| RpcError::internal_error(e.to_string()))
}

fn notification_frame<P: Serialize + ?Sized>(method: &str, params: &P) -> Option<String> {
    let encoded = serde_json::to_value(params)
        .and_then(|params| serde_json::to_string(&JsonRpcNotification::new(method, Some(params))));
    match encoded {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(method, error = %e, "Failed to encode notification");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use mockall::predicate::eq;
    use rust_decimal::Decimal;
    use serde_json::json;
    use test_case::test_case;
    use tokio::time::timeout;

    use super::*;
    use crate::application::ports::{FeedError, FeedEvent, MockTradeFeed};
    use crate::domain::streaming::Side;
    use crate::domain::subscription::SubscriptionMultiplexer;
    use crate::infrastructure::cache::RecentTradeCache;

    const WAIT: Duration = Duration::from_secs(2);

    fn dispatcher(feed: MockTradeFeed) -> Arc<Dispatcher> {
        let service = Arc::new(TradeDataService::new(
            Arc::new(feed),
            Arc::new(SubscriptionMultiplexer::new()),
            Arc::new(RecentTradeCache::new()),
            16,
        ));
        Arc::new(Dispatcher::new(service, Arc::new(ConnectionHub::new())))
    }

    fn permissive_feed() -> MockTradeFeed {
        let mut feed = MockTradeFeed::new();
        feed.expect_subscribe().returning(|_| Ok(()));
        feed.expect_unsubscribe().returning(|_| Ok(()));
        feed
    }

    fn request(method: &str, symbol: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": {"channel": "trades", "symbol": symbol},
            "id": "1"
        })
        .to_string()
    }

    fn error_of(response: &JsonRpcResponse) -> &RpcError {
        response.error.as_ref().expect("error response")
    }

    #[tokio::test]
    async fn unparseable_frame_yields_parse_error() {
        let dispatcher = dispatcher(MockTradeFeed::new());
        let conn = dispatcher.hub().register();

        let response = dispatcher.handle_frame(conn.id, "{oops").await;

        assert_eq!(error_of(&response).code, RpcError::PARSE_ERROR);
        assert_eq!(response.id, Value::Null);
    }

    #[test_case(r#"{"jsonrpc":"1.0","method":"subscribe","id":"9"}"# ; "wrong version")]
    #[test_case(r#"{"jsonrpc":"2.0","id":"9"}"# ; "missing method")]
    #[test_case(r#"{"jsonrpc":"2.0","method":"","id":"9"}"# ; "empty method")]
    #[tokio::test]
    async fn malformed_request_yields_invalid_request(frame: &str) {
        let dispatcher = dispatcher(MockTradeFeed::new());
        let conn = dispatcher.hub().register();

        let response = dispatcher.handle_frame(conn.id, frame).await;

        assert_eq!(error_of(&response).code, RpcError::INVALID_REQUEST);
        assert_eq!(response.id, json!("9"));
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let dispatcher = dispatcher(MockTradeFeed::new());
        let conn = dispatcher.hub().register();

        let response = dispatcher
            .handle_frame(conn.id, &request("history", "BTC-USD"))
            .await;

        assert_eq!(error_of(&response).code, RpcError::METHOD_NOT_FOUND);
    }

    #[test_case(json!({"channel": "quotes", "symbol": "BTC-USD"}), "Only 'trades' channel is supported" ; "wrong channel")]
    #[test_case(json!({"symbol": "BTC-USD"}), "Only 'trades' channel is supported" ; "missing channel")]
    #[test_case(json!({"channel": "trades"}), "Symbol is required" ; "missing symbol")]
    #[test_case(json!({"channel": "trades", "symbol": ""}), "Symbol is required" ; "empty symbol")]
    #[test_case(json!({"channel": "trades", "symbol": "DOGE-USD"}), "Invalid symbol: DOGE-USD" ; "unknown symbol")]
    #[tokio::test]
    async fn bad_params_yield_invalid_params(params: Value, details: &str) {
        let dispatcher = dispatcher(MockTradeFeed::new());
        let conn = dispatcher.hub().register();
        let frame = json!({"jsonrpc": "2.0", "method": "subscribe", "params": params, "id": 3});

        let response = dispatcher.handle_frame(conn.id, &frame.to_string()).await;

        let error = error_of(&response);
        assert_eq!(error.code, RpcError::INVALID_PARAMS);
        assert_eq!(error.data, Some(json!(details)));
        assert_eq!(response.id, json!(3));
        assert_eq!(dispatcher.hub().group_size(Instrument::BtcUsd), 0);
    }

    #[tokio::test]
    async fn subscribe_joins_group_and_responds() {
        let dispatcher = dispatcher(permissive_feed());
        let conn = dispatcher.hub().register();

        let response = dispatcher
            .handle_frame(
                conn.id,
                r#"{"jsonrpc":"2.0","method":"SUBSCRIBE","params":{"channel":"Trades","symbol":"BTC-USD"},"id":"1"}"#,
            )
            .await;

        assert_eq!(
            response.result,
            Some(json!({"channel": "trades", "symbol": "BTC-USD", "event": "subscribed"}))
        );
        assert!(dispatcher.hub().is_member(conn.id, Instrument::BtcUsd));
    }

    #[tokio::test]
    async fn two_connections_share_one_upstream_subscription() {
        let mut feed = MockTradeFeed::new();
        feed.expect_subscribe()
            .with(eq(Instrument::BtcUsd))
            .times(1)
            .returning(|_| Ok(()));
        feed.expect_unsubscribe()
            .with(eq(Instrument::BtcUsd))
            .times(1)
            .returning(|_| Ok(()));
        let dispatcher = dispatcher(feed);
        let a = dispatcher.hub().register();
        let b = dispatcher.hub().register();

        dispatcher.handle_frame(a.id, &request("subscribe", "BTC-USD")).await;
        dispatcher.handle_frame(b.id, &request("subscribe", "BTC-USD")).await;
        assert_eq!(dispatcher.service().multiplexer().count(Instrument::BtcUsd), 2);

        dispatcher.handle_frame(a.id, &request("unsubscribe", "BTC-USD")).await;
        assert_eq!(dispatcher.service().multiplexer().count(Instrument::BtcUsd), 1);

        let response = dispatcher
            .handle_frame(b.id, &request("unsubscribe", "BTC-USD"))
            .await;
        assert_eq!(
            response.result,
            Some(json!({"channel": "trades", "symbol": "BTC-USD", "event": "unsubscribed"}))
        );
    }

    #[tokio::test]
    async fn repeated_subscribe_takes_one_share() {
        let dispatcher = dispatcher(permissive_feed());
        let conn = dispatcher.hub().register();

        dispatcher.handle_frame(conn.id, &request("subscribe", "ETH-USD")).await;
        let response = dispatcher
            .handle_frame(conn.id, &request("subscribe", "ETH-USD"))
            .await;

        assert!(response.error.is_none());
        assert_eq!(dispatcher.service().multiplexer().count(Instrument::EthUsd), 1);
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_keeps_others_share() {
        let mut feed = MockTradeFeed::new();
        feed.expect_subscribe().times(1).returning(|_| Ok(()));
        feed.expect_unsubscribe().never();
        let dispatcher = dispatcher(feed);
        let a = dispatcher.hub().register();
        let b = dispatcher.hub().register();

        dispatcher.handle_frame(a.id, &request("subscribe", "BTC-USD")).await;
        let response = dispatcher
            .handle_frame(b.id, &request("unsubscribe", "BTC-USD"))
            .await;

        assert!(response.error.is_none());
        assert_eq!(dispatcher.service().multiplexer().count(Instrument::BtcUsd), 1);
    }

    #[tokio::test]
    async fn failed_upstream_subscribe_yields_internal_error_without_joining() {
        let mut feed = MockTradeFeed::new();
        feed.expect_subscribe()
            .returning(|_| Err(FeedError::NotConnected));
        let dispatcher = dispatcher(feed);
        let conn = dispatcher.hub().register();

        let response = dispatcher
            .handle_frame(conn.id, &request("subscribe", "BTC-USD"))
            .await;

        let error = error_of(&response);
        assert_eq!(error.code, RpcError::INTERNAL_ERROR);
        assert_eq!(
            error.data,
            Some(json!("upstream feed error: not connected to upstream feed"))
        );
        assert!(!dispatcher.hub().is_member(conn.id, Instrument::BtcUsd));
        assert_eq!(dispatcher.service().multiplexer().count(Instrument::BtcUsd), 0);
    }

    #[tokio::test]
    async fn closing_connection_releases_its_shares() {
        let mut feed = MockTradeFeed::new();
        feed.expect_subscribe().times(2).returning(|_| Ok(()));
        feed.expect_unsubscribe()
            .with(eq(Instrument::EthUsd))
            .times(1)
            .returning(|_| Ok(()));
        let dispatcher = dispatcher(feed);
        let a = dispatcher.hub().register();
        let b = dispatcher.hub().register();

        dispatcher.handle_frame(a.id, &request("subscribe", "BTC-USD")).await;
        dispatcher.handle_frame(a.id, &request("subscribe", "ETH-USD")).await;
        dispatcher.handle_frame(b.id, &request("subscribe", "BTC-USD")).await;

        dispatcher.connection_closed(a.id).await;

        let multiplexer = dispatcher.service().multiplexer();
        assert_eq!(multiplexer.count(Instrument::BtcUsd), 1);
        assert_eq!(multiplexer.count(Instrument::EthUsd), 0);
        assert_eq!(dispatcher.hub().connection_count(), 1);
    }

    #[tokio::test]
    async fn trades_reach_group_and_connection_events_reach_everyone() {
        let (tx, _) = broadcast::channel(16);
        let mut feed = permissive_feed();
        let events = tx.clone();
        feed.expect_events().returning(move || events.subscribe());
        feed.expect_connect().returning(|_| Ok(()));
        let dispatcher = dispatcher(feed);
        let mut subscribed = dispatcher.hub().register();
        let mut idle = dispatcher.hub().register();

        let cancel = CancellationToken::new();
        let broadcaster = dispatcher.spawn_broadcaster(cancel.clone());
        dispatcher.service().start(&cancel).await.unwrap();
        dispatcher
            .handle_frame(subscribed.id, &request("subscribe", "BTC-USD"))
            .await;

        tx.send(FeedEvent::TradeReceived(TradeEvent {
            seqnum: 7,
            event: EventKind::Updated,
            channel: Channel::Trades,
            instrument: Instrument::BtcUsd,
            timestamp: Utc::now(),
            side: Side::Sell,
            quantity: Decimal::new(5, 1),
            price: Decimal::new(4_200_010, 2),
            trade_id: "t-7".to_string(),
        }))
        .unwrap();
        tx.send(FeedEvent::ConnectionLost).unwrap();

        let frame = timeout(WAIT, subscribed.frames.recv()).await.unwrap().unwrap();
        let notification: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notification["method"], "trades.update");
        assert_eq!(notification["params"]["tradeId"], "t-7");
        assert_eq!(notification["params"]["symbol"], "BTC-USD");
        assert!(notification.get("id").is_none());

        let frame = timeout(WAIT, subscribed.frames.recv()).await.unwrap().unwrap();
        assert!(frame.contains("connection.lost"));

        // Not in the group: only the connection notice
        let frame = timeout(WAIT, idle.frames.recv()).await.unwrap().unwrap();
        let notification: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notification["method"], "connection.lost");
        assert_eq!(notification["params"]["reason"], CONNECTION_LOST_REASON);

        tx.send(FeedEvent::ConnectionRestored).unwrap();
        let frame = timeout(WAIT, idle.frames.recv()).await.unwrap().unwrap();
        let notification: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notification["method"], "connection.restored");
        assert_eq!(notification["params"], json!({"action": "resubscribe"}));

        cancel.cancel();
        broadcaster.await.unwrap();
    }
}
