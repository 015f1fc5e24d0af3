//! Recent-Trade Cache
//!
//! In-process store of trades per instrument, deduplicated by trade id and
//! read back most-recent-first. One lock guards the whole structure so an
//! insert and a read on the same instrument never race.
//!
//! There is no retention cap: entries accumulate until [`RecentTradeCache::clear`]
//! is called for the instrument; reads are limited by the requested count.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::application::ports::TradeRepository;
use crate::domain::streaming::{Instrument, TradeEvent};

#[derive(Debug, Default)]
struct CachedTrades {
    /// Insertion order.
    trades: Vec<TradeEvent>,
    ids: HashSet<String>,
}

/// Per-instrument recent-trade store.
#[derive(Debug, Default)]
pub struct RecentTradeCache {
    entries: RwLock<HashMap<Instrument, CachedTrades>>,
}

impl RecentTradeCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `trade` unless its id is already cached for the instrument.
    ///
    /// Returns whether the trade was added.
    pub fn add(&self, trade: TradeEvent) -> bool {
        let mut entries = self.entries.write();
        let cached = entries.entry(trade.instrument).or_default();

        if !cached.ids.insert(trade.trade_id.clone()) {
            return false;
        }
        cached.trades.push(trade);
        true
    }

    /// Up to `count` trades for `instrument`, newest timestamp first.
    #[must_use]
    pub fn get_recent(&self, instrument: Instrument, count: usize) -> Vec<TradeEvent> {
        let mut trades = self
            .entries
            .read()
            .get(&instrument)
            .map(|cached| cached.trades.clone())
            .unwrap_or_default();

        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        trades.truncate(count);
        trades
    }

    /// Drop every cached trade for `instrument`.
    pub fn clear(&self, instrument: Instrument) {
        self.entries.write().remove(&instrument);
    }

    /// Number of trades cached for `instrument`.
    #[must_use]
    pub fn len(&self, instrument: Instrument) -> usize {
        self.entries
            .read()
            .get(&instrument)
            .map_or(0, |cached| cached.trades.len())
    }

    /// Number of trades cached across all instruments.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.entries.read().values().map(|c| c.trades.len()).sum()
    }
}

impl TradeRepository for RecentTradeCache {
    fn add(&self, trade: TradeEvent) -> bool {
        Self::add(self, trade)
    }

    fn get_recent(&self, instrument: Instrument, count: usize) -> Vec<TradeEvent> {
        Self::get_recent(self, instrument, count)
    }

    fn clear(&self, instrument: Instrument) {
        Self::clear(self, instrument);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::streaming::{Channel, EventKind, Side};

    fn trade(instrument: Instrument, id: &str, second: i64) -> TradeEvent {
        TradeEvent {
            seqnum: 0,
            event: EventKind::Updated,
            channel: Channel::Trades,
            instrument,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::seconds(second),
            side: Side::Buy,
            quantity: Decimal::ONE,
            price: Decimal::new(100, 0),
            trade_id: id.to_string(),
        }
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let cache = RecentTradeCache::new();

        assert!(cache.add(trade(Instrument::BtcUsd, "a", 1)));
        assert!(!cache.add(trade(Instrument::BtcUsd, "a", 2)));

        let recent = cache.get_recent(Instrument::BtcUsd, 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].timestamp, trade(Instrument::BtcUsd, "a", 1).timestamp);
    }

    #[test]
    fn same_id_on_other_instrument_is_distinct() {
        let cache = RecentTradeCache::new();

        assert!(cache.add(trade(Instrument::BtcUsd, "a", 1)));
        assert!(cache.add(trade(Instrument::EthUsd, "a", 1)));
        assert_eq!(cache.total_len(), 2);
    }

    #[test]
    fn get_recent_orders_by_timestamp_descending() {
        let cache = RecentTradeCache::new();
        cache.add(trade(Instrument::EthUsd, "mid", 5));
        cache.add(trade(Instrument::EthUsd, "new", 9));
        cache.add(trade(Instrument::EthUsd, "old", 1));

        let ids: Vec<_> = cache
            .get_recent(Instrument::EthUsd, 10)
            .into_iter()
            .map(|t| t.trade_id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn get_recent_limits_count() {
        let cache = RecentTradeCache::new();
        for i in 0..20 {
            cache.add(trade(Instrument::BtcUsd, &i.to_string(), i));
        }

        let recent = cache.get_recent(Instrument::BtcUsd, 3);
        let ids: Vec<_> = recent.iter().map(|t| t.trade_id.as_str()).collect();
        assert_eq!(ids, vec!["19", "18", "17"]);
        assert!(cache.get_recent(Instrument::BtcUsd, 0).is_empty());
    }

    #[test]
    fn get_recent_unknown_instrument_is_empty() {
        let cache = RecentTradeCache::new();
        assert!(cache.get_recent(Instrument::BtcUsd, 5).is_empty());
    }

    #[test]
    fn clear_only_touches_one_instrument() {
        let cache = RecentTradeCache::new();
        cache.add(trade(Instrument::BtcUsd, "a", 1));
        cache.add(trade(Instrument::EthUsd, "b", 1));

        cache.clear(Instrument::BtcUsd);

        assert_eq!(cache.len(Instrument::BtcUsd), 0);
        assert_eq!(cache.len(Instrument::EthUsd), 1);
        // Cleared ids may be cached again
        assert!(cache.add(trade(Instrument::BtcUsd, "a", 1)));
    }

    #[test]
    fn concurrent_writers_and_readers() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(RecentTradeCache::new());
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..50 {
                        // Every writer repeats the same ids
                        cache.add(trade(Instrument::BtcUsd, &i.to_string(), i + w));
                    }
                })
            })
            .collect();
        let reader = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..50 {
                    assert!(cache.get_recent(Instrument::BtcUsd, 10).len() <= 10);
                }
            })
        };

        for handle in writers {
            handle.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(cache.len(Instrument::BtcUsd), 50);
    }

    proptest! {
        #[test]
        fn recent_is_bounded_and_descending(
            seconds in proptest::collection::vec(0i64..10_000, 0..64),
            count in 0usize..80,
        ) {
            let cache = RecentTradeCache::new();
            for (i, second) in seconds.iter().enumerate() {
                cache.add(trade(Instrument::EthUsd, &i.to_string(), *second));
            }

            let recent = cache.get_recent(Instrument::EthUsd, count);
            prop_assert!(recent.len() <= count);
            prop_assert_eq!(recent.len(), count.min(seconds.len()));
            prop_assert!(recent.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        }
    }
}
