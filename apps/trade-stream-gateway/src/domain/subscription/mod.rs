//! Subscription Multiplexing
//!
//! Reference counts downstream interest per instrument so that the gateway
//! keeps at most one upstream subscription open per instrument, no matter
//! how many downstream parties want it.
//!
//! # Design
//!
//! - An upstream subscribe is needed only on the 0→1 transition.
//! - An upstream unsubscribe is needed only on the 1→0 transition.
//! - Decrementing an absent entry is a no-op; counts never go below zero.
//!
//! Every compare-and-branch happens under one lock per multiplexer, so the
//! two operations never interleave for the same instrument.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::domain::streaming::Instrument;

// =============================================================================
// Subscription Multiplexer
// =============================================================================

/// Reference-count multiplexer for upstream subscriptions.
///
/// # Example
///
/// ```rust
/// use trade_stream_gateway::domain::streaming::Instrument;
/// use trade_stream_gateway::domain::subscription::SubscriptionMultiplexer;
///
/// let mux = SubscriptionMultiplexer::new();
///
/// // First interested party - upstream subscribe required
/// assert!(mux.should_subscribe_downstream(Instrument::BtcUsd));
/// // Second party shares the upstream subscription
/// assert!(!mux.should_subscribe_downstream(Instrument::BtcUsd));
///
/// assert!(!mux.should_unsubscribe_downstream(Instrument::BtcUsd));
/// // Last party gone - upstream unsubscribe required
/// assert!(mux.should_unsubscribe_downstream(Instrument::BtcUsd));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionMultiplexer {
    counts: Mutex<HashMap<Instrument, usize>>,
}

impl SubscriptionMultiplexer {
    /// Create an empty multiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more interested party for `instrument`.
    ///
    /// Returns `true` iff the count was zero before the increment, meaning
    /// an upstream subscribe is required.
    pub fn should_subscribe_downstream(&self, instrument: Instrument) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(instrument).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Release one interested party for `instrument`.
    ///
    /// Returns `true` iff the count reached exactly zero, meaning an
    /// upstream unsubscribe is required. Untracked instruments are a no-op
    /// returning `false`.
    pub fn should_unsubscribe_downstream(&self, instrument: Instrument) -> bool {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(&instrument) else {
            return false;
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&instrument);
            return true;
        }
        false
    }

    /// Drop every reference to `instrument` at once.
    ///
    /// Used when the upstream subscribe that the references were waiting on
    /// failed. Returns the number of references released.
    pub fn release_all(&self, instrument: Instrument) -> usize {
        self.counts.lock().remove(&instrument).unwrap_or(0)
    }

    /// Current reference count for `instrument`.
    #[must_use]
    pub fn count(&self, instrument: Instrument) -> usize {
        self.counts.lock().get(&instrument).copied().unwrap_or(0)
    }

    /// Instruments with at least one interested party, sorted.
    #[must_use]
    pub fn active_instruments(&self) -> Vec<Instrument> {
        let mut active: Vec<_> = self.counts.lock().keys().copied().collect();
        active.sort_unstable();
        active
    }

    /// Snapshot of all reference counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let counts = self.counts.lock();
        SubscriptionStats {
            instrument_count: counts.len(),
            total_references: counts.values().sum(),
            per_instrument: counts.iter().map(|(i, c)| (*i, *c)).collect(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time reference count snapshot.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStats {
    /// Number of instruments with an upstream subscription.
    pub instrument_count: usize,
    /// Sum of all reference counts.
    pub total_references: usize,
    /// Count per instrument.
    pub per_instrument: HashMap<Instrument, usize>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_subscribe_requires_upstream() {
        let mux = SubscriptionMultiplexer::new();

        assert!(mux.should_subscribe_downstream(Instrument::BtcUsd));
        assert_eq!(mux.count(Instrument::BtcUsd), 1);
    }

    #[test]
    fn later_subscribes_share_upstream() {
        let mux = SubscriptionMultiplexer::new();

        assert!(mux.should_subscribe_downstream(Instrument::BtcUsd));
        assert!(!mux.should_subscribe_downstream(Instrument::BtcUsd));
        assert!(!mux.should_subscribe_downstream(Instrument::BtcUsd));
        assert_eq!(mux.count(Instrument::BtcUsd), 3);
    }

    #[test]
    fn last_unsubscribe_requires_upstream() {
        let mux = SubscriptionMultiplexer::new();
        mux.should_subscribe_downstream(Instrument::EthUsd);
        mux.should_subscribe_downstream(Instrument::EthUsd);

        assert!(!mux.should_unsubscribe_downstream(Instrument::EthUsd));
        assert!(mux.should_unsubscribe_downstream(Instrument::EthUsd));
        assert_eq!(mux.count(Instrument::EthUsd), 0);
        assert!(mux.active_instruments().is_empty());
    }

    #[test]
    fn unsubscribe_untracked_is_noop() {
        let mux = SubscriptionMultiplexer::new();

        assert!(!mux.should_unsubscribe_downstream(Instrument::BtcUsd));
        assert_eq!(mux.count(Instrument::BtcUsd), 0);

        // A fresh subscribe after the no-op still counts as the first
        assert!(mux.should_subscribe_downstream(Instrument::BtcUsd));
    }

    #[test]
    fn instruments_are_independent() {
        let mux = SubscriptionMultiplexer::new();

        assert!(mux.should_subscribe_downstream(Instrument::BtcUsd));
        assert!(mux.should_subscribe_downstream(Instrument::EthUsd));
        assert!(mux.should_unsubscribe_downstream(Instrument::BtcUsd));
        assert_eq!(mux.active_instruments(), vec![Instrument::EthUsd]);
    }

    #[test]
    fn release_all_resets_to_first_subscriber() {
        let mux = SubscriptionMultiplexer::new();
        mux.should_subscribe_downstream(Instrument::BtcUsd);
        mux.should_subscribe_downstream(Instrument::BtcUsd);

        assert_eq!(mux.release_all(Instrument::BtcUsd), 2);
        assert_eq!(mux.release_all(Instrument::BtcUsd), 0);
        assert!(mux.should_subscribe_downstream(Instrument::BtcUsd));
    }

    #[test]
    fn stats_are_accurate() {
        let mux = SubscriptionMultiplexer::new();
        mux.should_subscribe_downstream(Instrument::BtcUsd);
        mux.should_subscribe_downstream(Instrument::BtcUsd);
        mux.should_subscribe_downstream(Instrument::EthUsd);

        let stats = mux.stats();
        assert_eq!(stats.instrument_count, 2);
        assert_eq!(stats.total_references, 3);
        assert_eq!(stats.per_instrument[&Instrument::BtcUsd], 2);
    }

    #[test]
    fn thread_safety_concurrent_subscribes() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::thread;

        let mux = Arc::new(SubscriptionMultiplexer::new());
        let firsts = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let mux = Arc::clone(&mux);
                let firsts = Arc::clone(&firsts);
                thread::spawn(move || {
                    if mux.should_subscribe_downstream(Instrument::BtcUsd) {
                        firsts.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(firsts.load(Ordering::SeqCst), 1);
        assert_eq!(mux.count(Instrument::BtcUsd), 16);
    }

    #[test]
    fn thread_safety_concurrent_unsubscribes() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::thread;

        let mux = Arc::new(SubscriptionMultiplexer::new());
        for _ in 0..16 {
            mux.should_subscribe_downstream(Instrument::EthUsd);
        }
        let lasts = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let mux = Arc::clone(&mux);
                let lasts = Arc::clone(&lasts);
                thread::spawn(move || {
                    if mux.should_unsubscribe_downstream(Instrument::EthUsd) {
                        lasts.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(lasts.load(Ordering::SeqCst), 1);
        assert_eq!(mux.count(Instrument::EthUsd), 0);
    }

    proptest! {
        #[test]
        fn n_subscribers_release_exactly_once(n in 1usize..64) {
            let mux = SubscriptionMultiplexer::new();
            let firsts = (0..n)
                .filter(|_| mux.should_subscribe_downstream(Instrument::BtcUsd))
                .count();
            prop_assert_eq!(firsts, 1);

            let releases: Vec<bool> = (0..n)
                .map(|_| mux.should_unsubscribe_downstream(Instrument::BtcUsd))
                .collect();
            prop_assert_eq!(releases.iter().filter(|r| !**r).count(), n - 1);
            prop_assert!(releases[n - 1]);
        }

        #[test]
        fn count_never_negative(ops in proptest::collection::vec(any::<bool>(), 0..128)) {
            let mux = SubscriptionMultiplexer::new();
            let mut expected = 0usize;
            for subscribe in ops {
                if subscribe {
                    let first = mux.should_subscribe_downstream(Instrument::EthUsd);
                    prop_assert_eq!(first, expected == 0);
                    expected += 1;
                } else {
                    let last = mux.should_unsubscribe_downstream(Instrument::EthUsd);
                    prop_assert_eq!(last, expected == 1);
                    expected = expected.saturating_sub(1);
                }
                prop_assert_eq!(mux.count(Instrument::EthUsd), expected);
            }
        }
    }
}
