//! Upstream Feed Codec
//!
//! JSON frames exchanged with the upstream trade feed.
//!
//! Outbound:
//! ```json
//! {"action":"subscribe","channel":"trades","symbol":"BTC-USD","token":"..."}
//! ```
//!
//! Inbound:
//! ```json
//! {"seqnum":2,"event":"updated","channel":"trades","symbol":"BTC-USD",
//!  "timestamp":"2019-08-13T11:30:06.100140Z","side":"sell","qty":8.5e-5,
//!  "price":11252.4,"trade_id":"12884909920"}
//! ```
//!
//! Decoding never panics or throws across the receive loop: every frame
//! yields either a [`FeedMessage`] or a [`CodecError`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{
    Channel, EventKind, Instrument, Side, SubscriptionAck, TradeEvent,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carried an event name outside the known set.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Frame named an instrument the gateway does not serve.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

// =============================================================================
// Outbound
// =============================================================================

/// Subscription action sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Start receiving trades.
    Subscribe,
    /// Stop receiving trades.
    Unsubscribe,
}

/// Outbound subscription request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest<'a> {
    action: Action,
    channel: Channel,
    symbol: Instrument,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

impl<'a> SubscriptionRequest<'a> {
    /// Build a trades-channel request.
    #[must_use]
    pub const fn new(action: Action, instrument: Instrument, token: Option<&'a str>) -> Self {
        Self {
            action,
            channel: Channel::Trades,
            symbol: instrument,
            token,
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Inbound
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: Option<String>,
    seqnum: Option<u64>,
    symbol: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    side: Option<String>,
    qty: Option<Decimal>,
    price: Option<Decimal>,
    trade_id: Option<String>,
    text: Option<String>,
}

/// A decoded upstream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Trade update.
    Trade(TradeEvent),
    /// Subscribe/unsubscribe acknowledgement.
    Ack(SubscriptionAck),
    /// The feed refused a request.
    Rejected {
        /// Feed-supplied explanation, if any.
        reason: Option<String>,
    },
    /// Well-formed frame with nothing to act on (no event, or a snapshot).
    Ignored,
}

/// Decode one inbound text frame.
///
/// Trades get field-level defaults: missing timestamp → now, missing side →
/// buy, missing quantity or price → zero, missing trade id → a fresh UUID.
///
/// # Errors
///
/// Returns an error for malformed JSON, unknown event names, and unknown or
/// missing instrument symbols on frames that need one.
pub fn decode(text: &str) -> Result<FeedMessage, CodecError> {
    let raw: RawFrame = serde_json::from_str(text)?;

    let Some(event) = raw.event.as_deref() else {
        return Ok(FeedMessage::Ignored);
    };
    let event: EventKind = event
        .parse()
        .map_err(|_| CodecError::UnknownEvent(event.to_string()))?;

    match event {
        EventKind::Subscribed | EventKind::Unsubscribed => Ok(FeedMessage::Ack(SubscriptionAck {
            seqnum: raw.seqnum.unwrap_or_default(),
            event,
            instrument: instrument(raw.symbol.as_deref())?,
        })),
        EventKind::Updated => {
            let side = match raw.side.as_deref() {
                Some(side) if side.eq_ignore_ascii_case("sell") => Side::Sell,
                _ => Side::Buy,
            };
            Ok(FeedMessage::Trade(TradeEvent {
                seqnum: raw.seqnum.unwrap_or_default(),
                event,
                channel: Channel::Trades,
                instrument: instrument(raw.symbol.as_deref())?,
                timestamp: raw.timestamp.unwrap_or_else(Utc::now),
                side,
                quantity: raw.qty.unwrap_or_default(),
                price: raw.price.unwrap_or_default(),
                trade_id: raw
                    .trade_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            }))
        }
        EventKind::Rejected => Ok(FeedMessage::Rejected { reason: raw.text }),
        EventKind::Snapshot => Ok(FeedMessage::Ignored),
    }
}

fn instrument(symbol: Option<&str>) -> Result<Instrument, CodecError> {
    let symbol = symbol.ok_or(CodecError::MissingField("symbol"))?;
    symbol
        .parse()
        .map_err(|_| CodecError::UnknownSymbol(symbol.to_string()))
}
