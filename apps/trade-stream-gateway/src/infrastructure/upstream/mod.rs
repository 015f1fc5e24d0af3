//! Upstream Trade Feed Adapter
//!
//! WebSocket client for the upstream trade feed: wire codec plus the
//! resilient connector implementing [`TradeFeed`](crate::application::ports::TradeFeed).

pub mod codec;
pub mod connector;

pub use codec::{Action, CodecError, FeedMessage, SubscriptionRequest};
pub use connector::{DEFAULT_EVENT_CAPACITY, UpstreamConfig, UpstreamConnector};
