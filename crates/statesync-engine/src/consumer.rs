//! Consumer loop: pulls messages from a subscription, dispatches them one
//! at a time and settles each according to its outcome.
//!
//! Several consumers may share one subscription. Each owns its dispatcher
//! and therefore its own state cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use statesync_bus::{Delivery, MessageSource, TransportError};

use crate::cache::{StateCache, TtlStateCache};
use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::SyncError;
use crate::monitor::Monitor;

/// Requeue policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_redeliveries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt of a message already requeued
    /// `redeliveries` times. Doubles per attempt up to the cap.
    pub fn delay(&self, redeliveries: u32) -> Duration {
        let factor = 2u32.saturating_pow(redeliveries);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, redeliveries: u32) -> bool {
        redeliveries >= self.max_redeliveries
    }
}

/// Counters for one consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub synced: u64,
    /// Non-retryable failures, acknowledged.
    pub dropped: u64,
    /// Transient failures, requeued.
    pub retried: u64,
    /// Transient failures that ran out of redeliveries.
    pub abandoned: u64,
    /// Cache entries evicted by the periodic sweep.
    pub purged: u64,
}

pub struct SyncConsumer<C: StateCache = TtlStateCache> {
    id: usize,
    source: Arc<dyn MessageSource>,
    dispatcher: Dispatcher<C>,
    monitor: Option<Monitor>,
    retry: RetryPolicy,
    sweep_interval: Duration,
}

impl<C: StateCache> SyncConsumer<C> {
    pub fn new(id: usize, source: Arc<dyn MessageSource>, dispatcher: Dispatcher<C>) -> Self {
        Self {
            id,
            source,
            dispatcher,
            monitor: None,
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// Publish dropped and abandoned messages to a monitor.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How often expired cache entries are purged.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Consume until `shutdown` flips, the subscription ends, or the
    /// transport fails. A message being handled when shutdown arrives is
    /// finished and settled first.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats, TransportError> {
        info!(consumer = self.id, "sync consumer started");
        let mut stats = ConsumerStats::default();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let received = tokio::select! {
                received = self.source.receive() => received,
                _ = shutdown.changed() => break,
                _ = sweep.tick() => {
                    let purged = self.dispatcher.cache_mut().purge_expired();
                    if purged > 0 {
                        debug!(consumer = self.id, purged, "expired cache entries purged");
                    }
                    stats.purged += purged as u64;
                    continue;
                }
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    info!(consumer = self.id, "subscription ended");
                    break;
                }
                Err(e) => {
                    error!(consumer = self.id, error = %e, "receive failed, stopping consumer");
                    return Err(e);
                }
            };

            stats.received += 1;
            if let Err(e) = self.settle(&delivery, &mut stats).await {
                if e.is_fatal() {
                    error!(consumer = self.id, error = %e, "transport lost, stopping consumer");
                    return Err(e);
                }
                error!(
                    consumer = self.id,
                    tag = delivery.tag,
                    error = %e,
                    "failed to settle message"
                );
            }
        }

        info!(
            consumer = self.id,
            received = stats.received,
            synced = stats.synced,
            dropped = stats.dropped,
            retried = stats.retried,
            abandoned = stats.abandoned,
            "sync consumer stopped"
        );
        Ok(stats)
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        stats: &mut ConsumerStats,
    ) -> Result<(), TransportError> {
        match self.dispatcher.handle(&delivery.payload).await {
            Outcome::Synced(report) => {
                stats.synced += 1;
                debug!(
                    consumer = self.id,
                    state_id = %report.state_id,
                    persisted = report.persisted,
                    "message synced"
                );
                self.source.ack(delivery).await
            }
            Outcome::Dropped(error) => {
                stats.dropped += 1;
                warn!(
                    consumer = self.id,
                    kind = error.kind(),
                    error = %error,
                    payload = %delivery.payload_lossy(),
                    "dropping message"
                );
                self.source.ack(delivery).await?;
                self.report(&error, delivery).await;
                Ok(())
            }
            Outcome::Retry(error) if self.retry.exhausted(delivery.redeliveries) => {
                stats.abandoned += 1;
                error!(
                    consumer = self.id,
                    redeliveries = delivery.redeliveries,
                    error = %error,
                    payload = %delivery.payload_lossy(),
                    "giving up on message"
                );
                self.source.ack(delivery).await?;
                self.report(&error, delivery).await;
                Ok(())
            }
            Outcome::Retry(error) => {
                stats.retried += 1;
                let delay = self.retry.delay(delivery.redeliveries);
                warn!(
                    consumer = self.id,
                    redeliveries = delivery.redeliveries,
                    ?delay,
                    error = %error,
                    "requeueing message"
                );
                self.source.nack(delivery, delay).await
            }
        }
    }

    async fn report(&self, error: &SyncError, delivery: &Delivery) {
        if let Some(monitor) = &self.monitor {
            monitor
                .report_failure(error, &delivery.payload_lossy(), delivery.redeliveries)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use statesync_bus::{InMemoryBus, MessageSink, StaticRouteTable};
    use statesync_core::{
        Processor, ProcessorProvider, ProcessorStateRoute, State, StateConfig,
    };
    use statesync_store::{RouteQuery, StateRepository, StateStore, StoreError, StoreResult};

    use tokio::sync::Notify;

    use crate::dispatcher::DispatchOptions;
    use crate::forward::ForwardRouter;

    const SYNC: &str = "sync";

    /// Delegates to a store but fails every save.
    struct BrokenSaves(StateStore);

    #[async_trait]
    impl StateRepository for BrokenSaves {
        async fn load_state(&self, id: &str, load_data: bool) -> StoreResult<Option<State>> {
            self.0.load_state(id, load_data).await
        }
        async fn save_state(&self, _state: &State) -> StoreResult<State> {
            Err(StoreError::Write("disk unavailable".into()))
        }
        async fn update_state_count(&self, state: &State) -> StoreResult<State> {
            self.0.update_state_count(state).await
        }
        async fn fetch_processor_state_route(
            &self,
            query: RouteQuery<'_>,
        ) -> StoreResult<Vec<ProcessorStateRoute>> {
            self.0.fetch_processor_state_route(query).await
        }
        async fn fetch_processor(&self, id: &str) -> StoreResult<Option<Processor>> {
            self.0.fetch_processor(id).await
        }
        async fn fetch_processor_provider(
            &self,
            id: &str,
        ) -> StoreResult<Option<ProcessorProvider>> {
            self.0.fetch_processor_provider(id).await
        }
    }

    /// Delegates to a store but holds each save until released.
    struct GatedSaves {
        inner: StateStore,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl StateRepository for GatedSaves {
        async fn load_state(&self, id: &str, load_data: bool) -> StoreResult<Option<State>> {
            self.inner.load_state(id, load_data).await
        }
        async fn save_state(&self, state: &State) -> StoreResult<State> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.save_state(state).await
        }
        async fn update_state_count(&self, state: &State) -> StoreResult<State> {
            self.inner.update_state_count(state).await
        }
        async fn fetch_processor_state_route(
            &self,
            query: RouteQuery<'_>,
        ) -> StoreResult<Vec<ProcessorStateRoute>> {
            self.inner.fetch_processor_state_route(query).await
        }
        async fn fetch_processor(&self, id: &str) -> StoreResult<Option<Processor>> {
            self.inner.fetch_processor(id).await
        }
        async fn fetch_processor_provider(
            &self,
            id: &str,
        ) -> StoreResult<Option<ProcessorProvider>> {
            self.inner.fetch_processor_provider(id).await
        }
    }

    fn assert_spawnable<F: std::future::Future + Send + 'static>(_: &F) {}

    fn consumer(bus: &InMemoryBus, store: Arc<dyn StateRepository>) -> SyncConsumer {
        let table = Arc::new(
            StaticRouteTable::default()
                .with_route("processor/state/router", ["down"])
                .with_route("processor/monitor", ["monitor"]),
        );
        let forwarder = ForwardRouter::new(
            store.clone(),
            Arc::new(bus.clone()),
            table.clone(),
            "processor/state/router",
        );
        let dispatcher = Dispatcher::new(
            store,
            forwarder,
            TtlStateCache::new(Duration::from_secs(30)),
            DispatchOptions::default(),
        );
        SyncConsumer::new(0, Arc::new(bus.subscribe(SYNC)), dispatcher).with_monitor(
            Monitor::new(Arc::new(bus.clone()), table, "processor/monitor"),
        )
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn direct(value: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "query_state_direct",
            "state_id": "S1",
            "query_state": [{ "col_a": value }]
        }))
        .unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_redeliveries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
        assert!(!policy.exhausted(9));
        assert!(policy.exhausted(10));
    }

    #[tokio::test]
    async fn syncs_until_shutdown() {
        let bus = InMemoryBus::new();
        let store = StateStore::open_in_memory().unwrap();
        store.register_state("S1", &StateConfig::new("s")).unwrap();
        let consumer = consumer(&bus, Arc::new(store.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        for i in 0..3 {
            bus.publish(SYNC, direct(i)).await.unwrap();
        }
        wait_until(|| store.get_state("S1", false).unwrap().unwrap().count == 3).await;

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.synced, 3);
        assert_eq!(bus.in_flight(SYNC), 0);
    }

    #[tokio::test]
    async fn poison_message_is_acked_and_reported() {
        let bus = InMemoryBus::new();
        let monitor = bus.subscribe("monitor");
        let store = StateStore::open_in_memory().unwrap();
        store.register_state("S1", &StateConfig::new("s")).unwrap();
        let consumer = consumer(&bus, Arc::new(store.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        bus.publish(SYNC, br#"{"state_id":"S1","query_state":[{"a":1}]}"#.to_vec())
            .await
            .unwrap();
        wait_until(|| bus.depth("monitor") == 1).await;

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(bus.in_flight(SYNC), 0);
        assert_eq!(bus.depth(SYNC), 0);
        assert_eq!(store.get_state("S1", false).unwrap().unwrap().version, 0);

        let event: Value = serde_json::from_slice(&monitor.try_receive().unwrap().payload).unwrap();
        assert_eq!(event["type"], "state_sync_failure");
    }

    #[tokio::test]
    async fn store_failures_retry_then_give_up() {
        let bus = InMemoryBus::new();
        let store = StateStore::open_in_memory().unwrap();
        store.register_state("S1", &StateConfig::new("s")).unwrap();
        let consumer = consumer(&bus, Arc::new(BrokenSaves(store.clone()))).with_retry(
            RetryPolicy {
                max_redeliveries: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        bus.publish(SYNC, direct(1)).await.unwrap();
        wait_until(|| bus.depth("monitor") == 1).await;

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(bus.in_flight(SYNC), 0);
    }

    #[tokio::test]
    async fn closed_subscription_ends_the_run() {
        let bus = InMemoryBus::new();
        let store = StateStore::open_in_memory().unwrap();
        let consumer = consumer(&bus, Arc::new(store));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        tokio::task::yield_now().await;
        bus.close();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_purges_expired_entries() {
        let bus = InMemoryBus::new();
        let store = StateStore::open_in_memory().unwrap();
        store.register_state("S1", &StateConfig::new("s")).unwrap();
        let consumer = consumer(&bus, Arc::new(store.clone()))
            .with_sweep_interval(Duration::from_secs(30));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        bus.publish(SYNC, direct(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.purged, 1);
    }

    #[test]
    fn run_future_can_be_spawned() {
        let bus = InMemoryBus::new();
        let store = StateStore::open_in_memory().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = consumer(&bus, Arc::new(store)).run(shutdown_rx);
        assert_spawnable(&run);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_message_in_flight() {
        let bus = InMemoryBus::new();
        let store = StateStore::open_in_memory().unwrap();
        store.register_state("S1", &StateConfig::new("s")).unwrap();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gated = GatedSaves {
            inner: store.clone(),
            entered: entered.clone(),
            release: release.clone(),
        };
        let consumer = consumer(&bus, Arc::new(gated));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        bus.publish(SYNC, direct(1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), entered.notified())
            .await
            .expect("save started");

        shutdown_tx.send(true).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(bus.in_flight(SYNC), 1);
        release.notify_one();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.synced, 1);
        assert_eq!(bus.in_flight(SYNC), 0);
        assert_eq!(bus.depth(SYNC), 0);
        assert_eq!(store.get_state("S1", false).unwrap().unwrap().count, 1);
    }
}
