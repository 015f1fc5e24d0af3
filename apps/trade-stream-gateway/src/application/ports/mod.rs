//! Port Interfaces
//!
//! Contracts that infrastructure adapters implement, following the
//! hexagonal layout.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`TradeFeed`]: the single upstream trade feed connection
//! - [`TradeRepository`]: recent-trade storage
//!
//! ## Events
//!
//! - [`FeedEvent`]: multicast events raised by a [`TradeFeed`]. Delivery is
//!   fire-and-forget; a receiver that falls behind skips events.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{Instrument, SubscriptionAck, TradeEvent};

/// Default number of trades returned by [`TradeRepository::get_recent`] callers.
pub const DEFAULT_RECENT_COUNT: usize = 100;

/// Event raised by the upstream feed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A trade arrived.
    TradeReceived(TradeEvent),
    /// The feed acknowledged a subscribe or unsubscribe.
    SubscriptionConfirmed(SubscriptionAck),
    /// The transport dropped unexpectedly; reconnection is under way.
    ConnectionLost,
    /// The transport is back and every tracked instrument was resubscribed.
    ConnectionRestored,
}

/// Failure reported by a [`TradeFeed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,
    /// No transport is available.
    #[error("not connected to upstream feed")]
    NotConnected,
    /// The frame could not be written.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// The upstream trade feed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeFeed: Send + Sync {
    /// Establish the connection, retrying until success or cancellation.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), FeedError>;

    /// Stop the receive loop and close the transport.
    async fn disconnect(&self) -> Result<(), FeedError>;

    /// Subscribe to trades for `instrument`.
    async fn subscribe(&self, instrument: Instrument) -> Result<(), FeedError>;

    /// Unsubscribe from trades for `instrument`.
    async fn unsubscribe(&self, instrument: Instrument) -> Result<(), FeedError>;

    /// Receiver for feed events raised from now on.
    fn events(&self) -> broadcast::Receiver<FeedEvent>;
}

/// Recent-trade storage keyed by instrument.
#[cfg_attr(test, mockall::automock)]
pub trait TradeRepository: Send + Sync {
    /// Store `trade` unless its id is already known for the instrument.
    fn add(&self, trade: TradeEvent) -> bool;

    /// Up to `count` trades for `instrument`, newest first.
    fn get_recent(&self, instrument: Instrument, count: usize) -> Vec<TradeEvent>;

    /// Forget every trade for `instrument`.
    fn clear(&self, instrument: Instrument);
}
