//! Trade Streaming Types
//!
//! Canonical representation of trade events flowing from the upstream feed
//! to downstream subscribers, plus the small enumerations that appear on
//! the wire. Every wire string maps through a static table; parsing is
//! exact-match and unknown values are rejected.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Wire Enumerations
// =============================================================================

/// Error returned when a wire string has no matching variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    /// Name of the enumeration being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant ),+
        }

        impl $name {
            /// Every variant paired with its wire string.
            pub const ALL: &'static [(Self, &'static str)] = &[ $( (Self::$variant, $wire) ),+ ];

            /// Wire representation.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $wire ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .find(|(_, wire)| *wire == s)
                    .map(|(variant, _)| *variant)
                    .ok_or_else(|| UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Tradable instrument served by the gateway.
    Instrument, "instrument" {
        /// Ether quoted in US dollars.
        EthUsd => "ETH-USD",
        /// Bitcoin quoted in US dollars.
        BtcUsd => "BTC-USD",
    }
}

wire_enum! {
    /// Aggressor side of a trade.
    Side, "side" {
        /// Buyer-initiated.
        Buy => "buy",
        /// Seller-initiated.
        Sell => "sell",
    }
}

wire_enum! {
    /// Data channel. Only trades are carried.
    Channel, "channel" {
        /// Executed trades.
        Trades => "trades",
    }
}

wire_enum! {
    /// Kind of event carried by a feed frame.
    EventKind, "event" {
        /// Subscription accepted.
        Subscribed => "subscribed",
        /// Subscription removed.
        Unsubscribed => "unsubscribed",
        /// Request refused by the feed.
        Rejected => "rejected",
        /// Initial state dump.
        Snapshot => "snapshot",
        /// Incremental trade update.
        Updated => "updated",
    }
}

// =============================================================================
// Trade Event
// =============================================================================

/// A single executed trade.
///
/// Serialized in the downstream notification shape:
/// `{seqnum, event, channel, symbol, timestamp, side, qty, price, tradeId}`.
/// The trade id is the dedup key within an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    /// Feed sequence number.
    pub seqnum: u64,
    /// Event kind (always `updated` for trades).
    pub event: EventKind,
    /// Channel the trade arrived on.
    pub channel: Channel,
    /// Traded instrument.
    #[serde(rename = "symbol")]
    pub instrument: Instrument,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Aggressor side.
    pub side: Side,
    /// Traded quantity.
    #[serde(rename = "qty")]
    pub quantity: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Feed-assigned trade identifier.
    pub trade_id: String,
}

/// Acknowledgement of an upstream subscribe or unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionAck {
    /// Feed sequence number.
    pub seqnum: u64,
    /// `Subscribed` or `Unsubscribed`.
    pub event: EventKind,
    /// Instrument the acknowledgement is for.
    pub instrument: Instrument,
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of a message-oriented connection.
///
/// `Disconnected → Connecting → Connected`, `Connected → Reconnecting →
/// Connected` on transient loss, and back to `Disconnected` on explicit
/// disconnect or fatal close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Transport established.
    Connected,
    /// Transport lost, re-establishing.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Whether the transport is usable.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use test_case::test_case;

    use super::*;

    #[test_case("BTC-USD", Instrument::BtcUsd)]
    #[test_case("ETH-USD", Instrument::EthUsd)]
    fn instrument_parses_wire_symbol(wire: &str, expected: Instrument) {
        assert_eq!(Instrument::from_str(wire).unwrap(), expected);
        assert_eq!(expected.as_str(), wire);
    }

    #[test_case("btc-usd")]
    #[test_case("BTCUSD")]
    #[test_case("")]
    fn instrument_rejects_unknown_symbol(wire: &str) {
        let err = Instrument::from_str(wire).unwrap_err();
        assert_eq!(err.kind, "instrument");
        assert_eq!(err.value, wire);
    }

    #[test]
    fn event_kind_table_is_complete() {
        for (variant, wire) in EventKind::ALL {
            assert_eq!(EventKind::from_str(wire).unwrap(), *variant);
        }
        assert_eq!(EventKind::ALL.len(), 5);
    }

    #[test]
    fn trade_event_serializes_notification_shape() {
        let trade = TradeEvent {
            seqnum: 7,
            event: EventKind::Updated,
            channel: Channel::Trades,
            instrument: Instrument::BtcUsd,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            side: Side::Sell,
            quantity: Decimal::new(25, 2),
            price: Decimal::new(4_200_050, 2),
            trade_id: "t-1".to_string(),
        };

        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["symbol"], "BTC-USD");
        assert_eq!(json["event"], "updated");
        assert_eq!(json["channel"], "trades");
        assert_eq!(json["side"], "sell");
        assert_eq!(json["tradeId"], "t-1");
        assert_eq!(json["seqnum"], 7);
        assert!(json.get("qty").is_some());
        assert!(json.get("trade_id").is_none());
    }

    #[test]
    fn connection_state_defaults_to_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert_eq!(
            serde_json::to_string(&ConnectionState::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
    }
}
