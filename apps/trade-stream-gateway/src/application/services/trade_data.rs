//! Trade Data Service
//!
//! Orchestrates the upstream feed on behalf of every downstream consumer:
//!
//! - `start` wires the feed event forwarder, then connects
//! - `stop` unwires the forwarder, then disconnects
//! - subscribe/unsubscribe only reach the feed on 0→1 / 1→0 transitions
//! - callers sharing an in-flight upstream subscribe get its outcome; a
//!   failed subscribe releases every reference taken while it was pending
//! - every trade is written to the repository before it is re-emitted

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedError, FeedEvent, TradeFeed, TradeRepository};
use crate::domain::streaming::{Instrument, TradeEvent};
use crate::domain::subscription::SubscriptionMultiplexer;

/// Event re-emitted by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A trade arrived and is already in the repository.
    Trade(TradeEvent),
    /// The upstream connection dropped.
    ConnectionLost,
    /// The upstream connection is back with all subscriptions replayed.
    ConnectionRestored,
}

/// Service errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The upstream feed failed.
    #[error("upstream feed error: {0}")]
    Feed(#[from] FeedError),
}

/// Outcome of an upstream subscribe, `None` while it is still in flight.
type SubscribeOutcome = Option<Result<(), FeedError>>;

enum Pending {
    /// This caller took the first reference and drives the upstream subscribe.
    Lead(watch::Sender<SubscribeOutcome>),
    /// Another caller holds the first reference.
    Share(Option<watch::Receiver<SubscribeOutcome>>),
}

struct Forwarder {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Trade data orchestrator.
pub struct TradeDataService {
    feed: Arc<dyn TradeFeed>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    repository: Arc<dyn TradeRepository>,
    events: broadcast::Sender<ServiceEvent>,
    forwarder: Mutex<Option<Forwarder>>,
    in_flight: Mutex<HashMap<Instrument, watch::Receiver<SubscribeOutcome>>>,
}

impl TradeDataService {
    /// Create a stopped service.
    #[must_use]
    pub fn new(
        feed: Arc<dyn TradeFeed>,
        multiplexer: Arc<SubscriptionMultiplexer>,
        repository: Arc<dyn TradeRepository>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            feed,
            multiplexer,
            repository,
            events,
            forwarder: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Wire feed events and connect upstream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is cancelled before it is
    /// established; the forwarder is unwired again in that case.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ServiceError> {
        self.wire();

        if let Err(e) = self.feed.connect(cancel).await {
            self.unwire().await;
            return Err(e.into());
        }

        tracing::info!("Trade data service started");
        Ok(())
    }

    /// Unwire feed events, then disconnect upstream.
    ///
    /// Once the forwarder is unwired no further events are re-emitted, even
    /// if the feed is still delivering.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed fails to disconnect.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.unwire().await;
        self.feed.disconnect().await?;
        tracing::info!("Trade data service stopped");
        Ok(())
    }

    /// Register interest in `instrument`, subscribing upstream if first.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream subscribe fails, both to the caller
    /// that issued it and to every caller that joined while it was in
    /// flight. All of their references are released in that case.
    pub async fn subscribe_to_trades(&self, instrument: Instrument) -> Result<(), ServiceError> {
        let pending = {
            let mut in_flight = self.in_flight.lock();
            if self.multiplexer.should_subscribe_downstream(instrument) {
                let (outcome, waiters) = watch::channel(None);
                in_flight.insert(instrument, waiters);
                Pending::Lead(outcome)
            } else {
                Pending::Share(in_flight.get(&instrument).cloned())
            }
        };

        match pending {
            Pending::Lead(outcome) => self.lead_subscribe(instrument, outcome).await,
            Pending::Share(None) => {
                tracing::debug!(instrument = %instrument, "Sharing existing upstream subscription");
                Ok(())
            }
            Pending::Share(Some(mut waiters)) => {
                tracing::debug!(instrument = %instrument, "Waiting on in-flight upstream subscribe");
                let outcome = waiters
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|settled| settled.clone())
                    .unwrap_or(Err(FeedError::Cancelled));
                outcome.map_err(ServiceError::from)
            }
        }
    }

    async fn lead_subscribe(
        &self,
        instrument: Instrument,
        outcome: watch::Sender<SubscribeOutcome>,
    ) -> Result<(), ServiceError> {
        let mut flight = InFlightSubscribe {
            service: self,
            instrument,
            outcome: Some(outcome),
        };

        let result = self.feed.subscribe(instrument).await;
        if let Err(e) = &result {
            tracing::warn!(instrument = %instrument, error = %e, "Upstream subscribe failed");
        }
        flight.settle(result.clone());
        result.map_err(ServiceError::from)
    }

    /// Release interest in `instrument`, unsubscribing upstream if last.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream unsubscribe fails.
    pub async fn unsubscribe_from_trades(&self, instrument: Instrument) -> Result<(), ServiceError> {
        if !self.multiplexer.should_unsubscribe_downstream(instrument) {
            return Ok(());
        }

        self.feed.unsubscribe(instrument).await.map_err(|e| {
            tracing::warn!(instrument = %instrument, error = %e, "Upstream unsubscribe failed");
            ServiceError::from(e)
        })
    }

    /// Up to `count` cached trades for `instrument`, newest first.
    #[must_use]
    pub fn get_recent_trades(&self, instrument: Instrument, count: usize) -> Vec<TradeEvent> {
        self.repository.get_recent(instrument, count)
    }

    /// Receiver for service events raised from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// The reference-count multiplexer.
    #[must_use]
    pub const fn multiplexer(&self) -> &Arc<SubscriptionMultiplexer> {
        &self.multiplexer
    }

    fn wire(&self) {
        let mut slot = self.forwarder.lock();
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward_events(
            self.feed.events(),
            Arc::clone(&self.repository),
            self.events.clone(),
            cancel.clone(),
        ));
        *slot = Some(Forwarder { cancel, handle });
    }

    async fn unwire(&self) {
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.cancel.cancel();
            if let Err(e) = forwarder.handle.await {
                tracing::warn!(error = %e, "Feed event forwarder failed");
            }
        }
    }
}

/// The upstream subscribe issued by the first interested caller.
///
/// Settling publishes the outcome to every caller that joined meanwhile. If
/// the issuing future is dropped before the feed answers, the subscribe
/// settles as cancelled.
struct InFlightSubscribe<'a> {
    service: &'a TradeDataService,
    instrument: Instrument,
    outcome: Option<watch::Sender<SubscribeOutcome>>,
}

impl InFlightSubscribe<'_> {
    fn settle(&mut self, result: Result<(), FeedError>) {
        let Some(outcome) = self.outcome.take() else {
            return;
        };

        // Same lock that orders new references against this entry
        let mut in_flight = self.service.in_flight.lock();
        in_flight.remove(&self.instrument);
        if result.is_err() {
            let released = self.service.multiplexer.release_all(self.instrument);
            tracing::debug!(
                instrument = %self.instrument,
                released,
                "Released references of failed subscribe"
            );
        }
        outcome.send_replace(Some(result));
    }
}

impl Drop for InFlightSubscribe<'_> {
    fn drop(&mut self) {
        self.settle(Err(FeedError::Cancelled));
    }
}

async fn forward_events(
    mut rx: broadcast::Receiver<FeedEvent>,
    repository: Arc<dyn TradeRepository>,
    events: broadcast::Sender<ServiceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = rx.recv() => received,
        };

        let event = match received {
            Ok(FeedEvent::TradeReceived(trade)) => {
                repository.add(trade.clone());
                ServiceEvent::Trade(trade)
            }
            Ok(FeedEvent::ConnectionLost) => ServiceEvent::ConnectionLost,
            Ok(FeedEvent::ConnectionRestored) => ServiceEvent::ConnectionRestored,
            Ok(FeedEvent::SubscriptionConfirmed(_)) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Feed event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if cancel.is_cancelled() {
            break;
        }
        let _ = events.send(event);
    }

    tracing::debug!("Feed event forwarder stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::predicate::eq;
    use rust_decimal::Decimal;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;
    use crate::application::ports::MockTradeFeed;
    use crate::domain::streaming::{Channel, EventKind, Side};
    use crate::infrastructure::cache::RecentTradeCache;

    const WAIT: Duration = Duration::from_secs(2);

    fn trade(id: &str) -> TradeEvent {
        TradeEvent {
            seqnum: 1,
            event: EventKind::Updated,
            channel: Channel::Trades,
            instrument: Instrument::BtcUsd,
            timestamp: Utc::now(),
            side: Side::Buy,
            quantity: Decimal::ONE,
            price: Decimal::new(42_000, 0),
            trade_id: id.to_string(),
        }
    }

    /// Mock feed whose events come from the returned sender.
    fn feed_with_events() -> (MockTradeFeed, broadcast::Sender<FeedEvent>) {
        let (tx, _) = broadcast::channel(16);
        let mut feed = MockTradeFeed::new();
        let events = tx.clone();
        feed.expect_events().returning(move || events.subscribe());
        (feed, tx)
    }

    fn service(feed: MockTradeFeed) -> (TradeDataService, Arc<RecentTradeCache>) {
        let cache = Arc::new(RecentTradeCache::new());
        let service = TradeDataService::new(
            Arc::new(feed),
            Arc::new(SubscriptionMultiplexer::new()),
            cache.clone(),
            16,
        );
        (service, cache)
    }

    #[tokio::test]
    async fn two_subscribers_one_upstream_subscribe() {
        let mut feed = MockTradeFeed::new();
        feed.expect_subscribe()
            .with(eq(Instrument::BtcUsd))
            .times(1)
            .returning(|_| Ok(()));
        let (service, _) = service(feed);

        service.subscribe_to_trades(Instrument::BtcUsd).await.unwrap();
        service.subscribe_to_trades(Instrument::BtcUsd).await.unwrap();

        assert_eq!(service.multiplexer().count(Instrument::BtcUsd), 2);
    }

    #[tokio::test]
    async fn upstream_unsubscribe_only_for_last() {
        let mut feed = MockTradeFeed::new();
        feed.expect_subscribe().times(1).returning(|_| Ok(()));
        feed.expect_unsubscribe()
            .with(eq(Instrument::BtcUsd))
            .times(1)
            .returning(|_| Ok(()));
        let (service, _) = service(feed);

        service.subscribe_to_trades(Instrument::BtcUsd).await.unwrap();
        service.subscribe_to_trades(Instrument::BtcUsd).await.unwrap();
        service.unsubscribe_from_trades(Instrument::BtcUsd).await.unwrap();
        service.unsubscribe_from_trades(Instrument::BtcUsd).await.unwrap();

        // Extra release is a no-op
        service.unsubscribe_from_trades(Instrument::BtcUsd).await.unwrap();
        assert_eq!(service.multiplexer().count(Instrument::BtcUsd), 0);
    }

    #[tokio::test]
    async fn failed_upstream_subscribe_releases_reference() {
        let mut feed = MockTradeFeed::new();
        let mut attempts = 0;
        feed.expect_subscribe().times(2).returning(move |_| {
            attempts += 1;
            if attempts == 1 {
                Err(FeedError::NotConnected)
            } else {
                Ok(())
            }
        });
        let (service, _) = service(feed);

        let err = service
            .subscribe_to_trades(Instrument::EthUsd)
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::Feed(FeedError::NotConnected));
        assert_eq!(service.multiplexer().count(Instrument::EthUsd), 0);

        // Next caller is first again and reaches upstream
        service.subscribe_to_trades(Instrument::EthUsd).await.unwrap();
        assert_eq!(service.multiplexer().count(Instrument::EthUsd), 1);
    }

    /// Feed whose upstream subscribe blocks until the test releases it.
    struct GatedFeed {
        release: Notify,
        calls: AtomicUsize,
        failures: AtomicUsize,
        events: broadcast::Sender<FeedEvent>,
    }

    impl GatedFeed {
        /// The first `failures` subscribes fail once released.
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(failures),
                events: broadcast::channel(16).0,
            })
        }

        async fn wait_for_calls(&self, expected: usize) {
            while self.calls.load(Ordering::SeqCst) < expected {
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait]
    impl TradeFeed for GatedFeed {
        async fn connect(&self, _cancel: &CancellationToken) -> Result<(), FeedError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), FeedError> {
            Ok(())
        }

        async fn subscribe(&self, _instrument: Instrument) -> Result<(), FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(FeedError::NotConnected)
            } else {
                Ok(())
            }
        }

        async fn unsubscribe(&self, _instrument: Instrument) -> Result<(), FeedError> {
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<FeedEvent> {
            self.events.subscribe()
        }
    }

    fn gated_service(feed: &Arc<GatedFeed>) -> Arc<TradeDataService> {
        Arc::new(TradeDataService::new(
            Arc::clone(feed) as Arc<dyn TradeFeed>,
            Arc::new(SubscriptionMultiplexer::new()),
            Arc::new(RecentTradeCache::new()),
            16,
        ))
    }

    /// Spawns a subscribe and waits until it has taken its reference.
    async fn spawn_subscribe(
        service: &Arc<TradeDataService>,
        references: usize,
    ) -> JoinHandle<Result<(), ServiceError>> {
        let handle = tokio::spawn({
            let service = Arc::clone(service);
            async move { service.subscribe_to_trades(Instrument::BtcUsd).await }
        });
        while service.multiplexer().count(Instrument::BtcUsd) < references {
            tokio::task::yield_now().await;
        }
        handle
    }

    #[tokio::test]
    async fn subscribers_joining_a_failing_subscribe_fail_with_it() {
        let feed = GatedFeed::new(1);
        let service = gated_service(&feed);

        let first = spawn_subscribe(&service, 1).await;
        feed.wait_for_calls(1).await;
        let second = spawn_subscribe(&service, 2).await;

        feed.release.notify_one();

        let first = timeout(WAIT, first).await.unwrap().unwrap();
        let second = timeout(WAIT, second).await.unwrap().unwrap();
        assert_eq!(first, Err(ServiceError::Feed(FeedError::NotConnected)));
        assert_eq!(second, Err(ServiceError::Feed(FeedError::NotConnected)));
        assert_eq!(service.multiplexer().count(Instrument::BtcUsd), 0);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);

        // The next caller is first again and reaches upstream
        let retry = spawn_subscribe(&service, 1).await;
        feed.wait_for_calls(2).await;
        feed.release.notify_one();
        assert_eq!(timeout(WAIT, retry).await.unwrap().unwrap(), Ok(()));
        assert_eq!(service.multiplexer().count(Instrument::BtcUsd), 1);
    }

    #[tokio::test]
    async fn subscribers_joining_a_successful_subscribe_share_it() {
        let feed = GatedFeed::new(0);
        let service = gated_service(&feed);

        let first = spawn_subscribe(&service, 1).await;
        feed.wait_for_calls(1).await;
        let second = spawn_subscribe(&service, 2).await;

        // Still waiting on the upstream answer
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        feed.release.notify_one();

        assert_eq!(timeout(WAIT, first).await.unwrap().unwrap(), Ok(()));
        assert_eq!(timeout(WAIT, second).await.unwrap().unwrap(), Ok(()));
        assert_eq!(service.multiplexer().count(Instrument::BtcUsd), 2);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_first_subscriber_settles_as_cancelled() {
        let feed = GatedFeed::new(0);
        let service = gated_service(&feed);

        let first = spawn_subscribe(&service, 1).await;
        feed.wait_for_calls(1).await;
        let second = spawn_subscribe(&service, 2).await;

        first.abort();

        let second = timeout(WAIT, second).await.unwrap().unwrap();
        assert_eq!(second, Err(ServiceError::Feed(FeedError::Cancelled)));
        assert_eq!(service.multiplexer().count(Instrument::BtcUsd), 0);
    }

    #[tokio::test]
    async fn trades_are_cached_before_reemission() {
        let (mut feed, tx) = feed_with_events();
        feed.expect_connect().times(1).returning(|_| Ok(()));
        let (service, cache) = service(feed);
        let mut events = service.events();

        service.start(&CancellationToken::new()).await.unwrap();
        let sent = trade("t-1");
        tx.send(FeedEvent::TradeReceived(sent.clone())).unwrap();

        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, ServiceEvent::Trade(sent));
        assert_eq!(cache.len(Instrument::BtcUsd), 1);
        assert_eq!(service.get_recent_trades(Instrument::BtcUsd, 10).len(), 1);
    }

    #[tokio::test]
    async fn connection_events_are_reemitted() {
        let (mut feed, tx) = feed_with_events();
        feed.expect_connect().returning(|_| Ok(()));
        let (service, _) = service(feed);
        let mut events = service.events();

        service.start(&CancellationToken::new()).await.unwrap();
        tx.send(FeedEvent::ConnectionLost).unwrap();
        tx.send(FeedEvent::ConnectionRestored).unwrap();

        assert_eq!(
            timeout(WAIT, events.recv()).await.unwrap().unwrap(),
            ServiceEvent::ConnectionLost
        );
        assert_eq!(
            timeout(WAIT, events.recv()).await.unwrap().unwrap(),
            ServiceEvent::ConnectionRestored
        );
    }

    #[tokio::test]
    async fn nothing_is_forwarded_after_stop() {
        let (mut feed, tx) = feed_with_events();
        feed.expect_connect().returning(|_| Ok(()));
        feed.expect_disconnect().times(1).returning(|| Ok(()));
        let (service, cache) = service(feed);
        let mut events = service.events();

        service.start(&CancellationToken::new()).await.unwrap();
        service.stop().await.unwrap();

        // The feed may still be mid-flight
        let _ = tx.send(FeedEvent::TradeReceived(trade("late")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(cache.len(Instrument::BtcUsd), 0);
    }

    #[tokio::test]
    async fn failed_start_unwires() {
        let (mut feed, tx) = feed_with_events();
        feed.expect_connect()
            .returning(|_| Err(FeedError::Cancelled));
        let (service, _) = service(feed);

        let err = service.start(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err, ServiceError::Feed(FeedError::Cancelled));
        assert_eq!(tx.receiver_count(), 0);
    }
}
