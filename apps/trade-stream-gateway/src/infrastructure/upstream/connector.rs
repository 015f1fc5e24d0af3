//! Upstream Connector
//!
//! Owns the single connection to the upstream trade feed, running on a
//! [`ReconnectingLink`].
//!
//! # Lifecycle
//!
//! 1. `connect` opens the link, retrying through its backoff, and starts the
//!    receive loop.
//! 2. Inbound frames are decoded and raised as [`FeedEvent`]s on a broadcast
//!    channel. Malformed frames are logged, counted and dropped.
//! 3. When the transport closes or errors without a deliberate disconnect,
//!    `ConnectionLost` is raised, the link re-opens, every tracked instrument
//!    is resubscribed in tracking order, then `ConnectionRestored` is raised.
//! 4. `disconnect` ends the link and waits for its session task.
//!
//! Subscribe, unsubscribe and the resubscribe replay all hold the tracked
//! set across their write, so an instrument is tracked exactly when its
//! subscribe reached the transport the replay was made for.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::codec::{self, Action, FeedMessage, SubscriptionRequest};
use crate::application::ports::{FeedError, FeedEvent, TradeFeed};
use crate::domain::streaming::{ConnectionState, Instrument};
use crate::infrastructure::metrics::{self, FrameKind, ParseSide};
use crate::infrastructure::retry::BackoffStrategy;
use crate::infrastructure::transport::{
    FrameTransport, LinkError, LinkHandler, ReconnectingLink, Reopened, TransportError,
};

/// Default capacity of the feed event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Upstream connection settings.
#[derive(Clone)]
pub struct UpstreamConfig {
    /// Feed WebSocket URL.
    pub url: String,
    /// Optional auth token attached to every subscription request.
    pub token: Option<String>,
    /// Capacity of the feed event broadcast channel.
    pub event_capacity: usize,
}

impl UpstreamConfig {
    /// Settings for `url` without a token.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Attach an auth token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Resilient upstream feed connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UpstreamConnector {
    link: ReconnectingLink,
    feed: Arc<FeedState>,
}

/// Feed-specific state behind the link.
struct FeedState {
    token: Option<String>,
    /// Instruments that should be subscribed; survives reconnects.
    tracked: Mutex<Vec<Instrument>>,
    events: broadcast::Sender<FeedEvent>,
}

impl UpstreamConnector {
    /// Create a disconnected connector.
    #[must_use]
    pub fn new(
        config: UpstreamConfig,
        transport: Arc<dyn FrameTransport>,
        backoff: Arc<dyn BackoffStrategy>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let feed = Arc::new(FeedState {
            token: config.token,
            tracked: Mutex::new(Vec::new()),
            events,
        });
        let link = ReconnectingLink::new(
            "upstream",
            config.url,
            transport,
            backoff,
            Arc::clone(&feed) as Arc<dyn LinkHandler>,
        );

        Self { link, feed }
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Watch connection state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.link.state_changes()
    }

    /// Instruments currently marked as subscribed, in subscription order.
    pub async fn tracked_instruments(&self) -> Vec<Instrument> {
        self.feed.tracked.lock().await.clone()
    }

    async fn send_request(&self, action: Action, instrument: Instrument) -> Result<(), FeedError> {
        let frame = self
            .feed
            .request(action, instrument)
            .map_err(|e| FeedError::SendFailed(e.to_string()))?;
        self.link.send(frame).await.map_err(|e| match e {
            LinkError::Cancelled | LinkError::NotConnected => FeedError::NotConnected,
            LinkError::Transport(e) => FeedError::SendFailed(e.to_string()),
        })
    }
}

#[async_trait]
impl TradeFeed for UpstreamConnector {
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), FeedError> {
        self.link.connect(cancel).await.map_err(|e| match e {
            LinkError::NotConnected | LinkError::Cancelled => FeedError::Cancelled,
            LinkError::Transport(e) => FeedError::SendFailed(e.to_string()),
        })
    }

    async fn disconnect(&self) -> Result<(), FeedError> {
        self.link.disconnect().await;
        Ok(())
    }

    async fn subscribe(&self, instrument: Instrument) -> Result<(), FeedError> {
        let mut tracked = self.feed.tracked.lock().await;
        self.send_request(Action::Subscribe, instrument).await?;
        if !tracked.contains(&instrument) {
            tracked.push(instrument);
        }
        drop(tracked);

        tracing::info!(instrument = %instrument, "Subscribed upstream");
        Ok(())
    }

    async fn unsubscribe(&self, instrument: Instrument) -> Result<(), FeedError> {
        let mut tracked = self.feed.tracked.lock().await;
        self.send_request(Action::Unsubscribe, instrument).await?;
        tracked.retain(|i| *i != instrument);
        drop(tracked);

        tracing::info!(instrument = %instrument, "Unsubscribed upstream");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed.events.subscribe()
    }
}

impl FeedState {
    fn emit(&self, event: FeedEvent) {
        // No receivers is fine: events are fire-and-forget
        let _ = self.events.send(event);
    }

    fn request(&self, action: Action, instrument: Instrument) -> Result<String, codec::CodecError> {
        SubscriptionRequest::new(action, instrument, self.token.as_deref()).encode()
    }
}

#[async_trait]
impl LinkHandler for FeedState {
    fn on_frame(&self, text: String) {
        match codec::decode(&text) {
            Ok(FeedMessage::Trade(trade)) => {
                metrics::record_upstream_frame(FrameKind::Trade);
                self.emit(FeedEvent::TradeReceived(trade));
            }
            Ok(FeedMessage::Ack(ack)) => {
                metrics::record_upstream_frame(FrameKind::Ack);
                tracing::debug!(
                    instrument = %ack.instrument,
                    event = %ack.event,
                    seqnum = ack.seqnum,
                    "Subscription confirmed"
                );
                self.emit(FeedEvent::SubscriptionConfirmed(ack));
            }
            Ok(FeedMessage::Rejected { reason }) => {
                metrics::record_upstream_frame(FrameKind::Rejected);
                tracing::warn!(reason = ?reason, "Upstream rejected request");
            }
            Ok(FeedMessage::Ignored) => {
                metrics::record_upstream_frame(FrameKind::Other);
            }
            Err(e) => {
                metrics::record_parse_failure(ParseSide::Upstream);
                tracing::warn!(error = %e, "Dropping unparseable upstream frame");
            }
        }
    }

    fn on_state(&self, state: ConnectionState) {
        metrics::set_upstream_connected(state.is_connected());
    }

    fn on_lost(&self, _reason: &str) {
        metrics::record_upstream_reconnect();
        self.emit(FeedEvent::ConnectionLost);
    }

    async fn restore(&self, reopened: &Reopened<'_>) -> Result<(), TransportError> {
        let tracked = self.tracked.lock().await;
        for instrument in tracked.iter().copied() {
            let frame = self
                .request(Action::Subscribe, instrument)
                .map_err(|e| TransportError::Send(e.to_string()))?;
            reopened.send(frame).await?;
            tracing::info!(instrument = %instrument, "Resubscribed upstream");
        }
        // Publish before releasing the set so no subscribe slips between
        reopened.publish();
        Ok(())
    }

    fn on_restored(&self) {
        self.emit(FeedEvent::ConnectionRestored);
    }
}
