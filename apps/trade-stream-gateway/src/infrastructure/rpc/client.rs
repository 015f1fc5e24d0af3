//! Trade Stream Client
//!
//! Typed wrapper over an [`RpcEngine`] for the gateway's trade methods and
//! notifications. Remembers which instruments it subscribed to so they can
//! be replayed after the client's own connection was re-established.

use std::pin::Pin;

use futures::{Stream, StreamExt, future};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::engine::{RpcClientError, RpcEngine};
use super::messages::{
    CONNECTION_LOST, CONNECTION_RESTORED, ConnectionLostParams, METHOD_SUBSCRIBE,
    METHOD_UNSUBSCRIBE, SubscriptionParams, SubscriptionResult, TRADES_UPDATE,
};
use crate::domain::streaming::{ConnectionState, Instrument, TradeEvent};

/// Stream of typed notification payloads.
pub type TypedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Client for the gateway's trade stream.
pub struct TradeStreamClient {
    engine: RpcEngine,
    subscriptions: Mutex<Vec<Instrument>>,
}

impl TradeStreamClient {
    /// Wrap `engine`.
    #[must_use]
    pub fn new(engine: RpcEngine) -> Self {
        Self {
            engine,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Connect the underlying engine.
    ///
    /// # Errors
    ///
    /// Returns the connection's error.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), RpcClientError> {
        self.engine.connect(cancel).await
    }

    /// Disconnect, failing pending calls.
    ///
    /// # Errors
    ///
    /// Returns the connection's error.
    pub async fn disconnect(&self) -> Result<(), RpcClientError> {
        self.engine.disconnect().await
    }

    /// Dispose the engine, ending every stream.
    pub async fn dispose(&self) {
        self.engine.dispose().await;
    }

    /// Watch the client connection state.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.engine.connection_state()
    }

    /// Instruments this client is subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Instrument> {
        self.subscriptions.lock().clone()
    }

    /// Subscribe to trades for `instrument`.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or [`RpcClientError::Encode`] if the result
    /// has an unexpected shape.
    pub async fn subscribe(&self, instrument: Instrument) -> Result<SubscriptionResult, RpcClientError> {
        let result = self.call(METHOD_SUBSCRIBE, instrument).await?;

        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.contains(&instrument) {
            subscriptions.push(instrument);
        }
        Ok(result)
    }

    /// Unsubscribe from trades for `instrument`.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or [`RpcClientError::Encode`] if the result
    /// has an unexpected shape.
    pub async fn unsubscribe(&self, instrument: Instrument) -> Result<SubscriptionResult, RpcClientError> {
        let result = self.call(METHOD_UNSUBSCRIBE, instrument).await?;
        self.subscriptions.lock().retain(|i| *i != instrument);
        Ok(result)
    }

    /// Subscribe again to every remembered instrument, in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing call and returns its error.
    pub async fn resubscribe_all(&self) -> Result<(), RpcClientError> {
        for instrument in self.subscriptions() {
            self.call(METHOD_SUBSCRIBE, instrument).await?;
        }
        Ok(())
    }

    /// Trades pushed through `trades.update`. Undecodable payloads are
    /// skipped.
    #[must_use]
    pub fn trade_updates(&self) -> TypedStream<TradeEvent> {
        decoded(self.engine.on_notification(TRADES_UPDATE))
    }

    /// Reasons carried by `connection.lost`.
    #[must_use]
    pub fn connection_lost(&self) -> TypedStream<String> {
        Box::pin(
            decoded::<ConnectionLostParams>(self.engine.on_notification(CONNECTION_LOST))
                .map(|params| params.reason),
        )
    }

    /// One item per `connection.restored`.
    #[must_use]
    pub fn connection_restored(&self) -> TypedStream<()> {
        Box::pin(self.engine.on_notification(CONNECTION_RESTORED).map(|_| ()))
    }

    async fn call(
        &self,
        method: &str,
        instrument: Instrument,
    ) -> Result<SubscriptionResult, RpcClientError> {
        let params = serde_json::to_value(SubscriptionParams::trades(instrument))
            .map_err(|e| RpcClientError::Encode(e.to_string()))?;
        let result = self.engine.invoke(method, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| RpcClientError::Encode(e.to_string()))
    }
}

fn decoded<T>(stream: Pin<Box<dyn Stream<Item = Value> + Send>>) -> TypedStream<T>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    Box::pin(stream.filter_map(|params| {
        future::ready(match serde_json::from_value(params) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping undecodable notification");
                None
            }
        })
    }))
}
