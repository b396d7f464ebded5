//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use statesync_bus::{
    Delivery, MessageSink, MessageSource, StaticRouteTable, TransportError, TransportResult,
};
use statesync_core::{
    Processor, ProcessorProvider, ProcessorStateDirection, ProcessorStateRoute, State,
    StateConfig,
};
use statesync_engine::{
    DispatchOptions, Dispatcher, ForwardRouter, Monitor, RetryPolicy, SyncConsumer,
    TtlStateCache,
};
use statesync_store::{RouteQuery, StateRepository, StateStore, StoreError, StoreResult};

pub const FORWARD_ROUTE: &str = "processor/state/router";
pub const MONITOR_ROUTE: &str = "processor/monitor";
pub const FORWARD_SUBJECT: &str = "state.router";
pub const MONITOR_SUBJECT: &str = "state.monitor";

// ── Store ─────────────────────────────────────────────────────────

/// Store wrapper counting every port call, with injectable save failures.
pub struct CountingStore {
    pub inner: StateStore,
    pub loads: AtomicUsize,
    pub saves: AtomicUsize,
    pub count_refreshes: AtomicUsize,
    pub route_lookups: AtomicUsize,
    failing_saves: AtomicUsize,
    failing_refreshes: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: StateStore) -> Self {
        Self {
            inner,
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            count_refreshes: AtomicUsize::new(0),
            route_lookups: AtomicUsize::new(0),
            failing_saves: AtomicUsize::new(0),
            failing_refreshes: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` saves with a transient write error.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` count refreshes.
    pub fn fail_next_refreshes(&self, n: usize) {
        self.failing_refreshes.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
            + self.saves.load(Ordering::SeqCst)
            + self.count_refreshes.load(Ordering::SeqCst)
            + self.route_lookups.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl StateRepository for CountingStore {
    async fn load_state(&self, state_id: &str, load_data: bool) -> StoreResult<Option<State>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_state(state_id, load_data).await
    }

    async fn save_state(&self, state: &State) -> StoreResult<State> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_saves) {
            return Err(StoreError::Write("injected save failure".into()));
        }
        self.inner.save_state(state).await
    }

    async fn update_state_count(&self, state: &State) -> StoreResult<State> {
        self.count_refreshes.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_refreshes) {
            return Err(StoreError::Write("injected count failure".into()));
        }
        self.inner.update_state_count(state).await
    }

    async fn fetch_processor_state_route(
        &self,
        query: RouteQuery<'_>,
    ) -> StoreResult<Vec<ProcessorStateRoute>> {
        self.route_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_processor_state_route(query).await
    }

    async fn fetch_processor(&self, processor_id: &str) -> StoreResult<Option<Processor>> {
        self.inner.fetch_processor(processor_id).await
    }

    async fn fetch_processor_provider(
        &self,
        provider_id: &str,
    ) -> StoreResult<Option<ProcessorProvider>> {
        self.inner.fetch_processor_provider(provider_id).await
    }
}

// ── Transport ─────────────────────────────────────────────────────

/// Sink that records every publish.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(dest, body)| (dest.clone(), serde_json::from_slice(body).unwrap()))
            .collect()
    }

    /// Decoded bodies published to one destination.
    pub fn published_to(&self, destination: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, body)| body)
            .collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((destination.to_string(), payload));
        Ok(())
    }
}

/// Scripted source. Ends the subscription once its queue is empty; nacked
/// messages go to the back of the queue with their delay ignored.
#[derive(Default)]
pub struct ScriptedSource {
    queue: Mutex<VecDeque<Delivery>>,
    next_tag: AtomicUsize,
    pub acked: Mutex<Vec<u64>>,
    pub nacked: Mutex<Vec<(u64, Duration)>>,
}

impl ScriptedSource {
    pub fn with_messages<I: IntoIterator<Item = Vec<u8>>>(payloads: I) -> Self {
        let source = Self::default();
        for payload in payloads {
            source.push(payload, 0);
        }
        source
    }

    fn push(&self, payload: Vec<u8>, redeliveries: u32) {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) as u64;
        self.queue.lock().unwrap().push_back(Delivery {
            tag,
            subject: "sync".to_string(),
            payload,
            redeliveries,
        });
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<(u64, Duration)> {
        self.nacked.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn receive(&self) -> TransportResult<Option<Delivery>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
        self.acked.lock().unwrap().push(delivery.tag);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> TransportResult<()> {
        self.nacked.lock().unwrap().push((delivery.tag, delay));
        self.push(delivery.payload.clone(), delivery.redeliveries + 1);
        Ok(())
    }
}

/// Source whose connection is gone.
pub struct LostSource;

#[async_trait]
impl MessageSource for LostSource {
    async fn receive(&self) -> TransportResult<Option<Delivery>> {
        Err(TransportError::ConnectionLost("broker".into()))
    }

    async fn ack(&self, _delivery: &Delivery) -> TransportResult<()> {
        Ok(())
    }

    async fn nack(&self, _delivery: &Delivery, _delay: Duration) -> TransportResult<()> {
        Ok(())
    }
}

// ── Wiring ────────────────────────────────────────────────────────

pub fn route_table() -> Arc<StaticRouteTable> {
    Arc::new(
        StaticRouteTable::default()
            .with_route(FORWARD_ROUTE, [FORWARD_SUBJECT])
            .with_route(MONITOR_ROUTE, [MONITOR_SUBJECT]),
    )
}

pub fn dispatcher(store: Arc<dyn StateRepository>, sink: Arc<dyn MessageSink>) -> Dispatcher {
    let forwarder = ForwardRouter::new(store.clone(), sink, route_table(), FORWARD_ROUTE);
    Dispatcher::new(
        store,
        forwarder,
        TtlStateCache::new(Duration::from_secs(30)),
        DispatchOptions::default(),
    )
}

pub fn consumer(
    source: Arc<dyn MessageSource>,
    store: Arc<dyn StateRepository>,
    sink: Arc<dyn MessageSink>,
) -> SyncConsumer {
    SyncConsumer::new(0, source, dispatcher(store, sink.clone()))
        .with_monitor(Monitor::new(sink, route_table(), MONITOR_ROUTE))
        .with_retry(RetryPolicy {
            max_redeliveries: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        })
}

// ── Graph ─────────────────────────────────────────────────────────

pub fn forwarding_config(name: &str) -> StateConfig {
    let mut config = StateConfig::new(name);
    config.flag_auto_route_output_state_after_save = true;
    config
}

/// Register `processor_id` backed by provider `V1`.
pub fn add_processor(store: &StateStore, processor_id: &str) {
    store
        .put_provider(&ProcessorProvider {
            id: "V1".to_string(),
            name: "openai".to_string(),
            version: Some("gpt-4".to_string()),
            class_name: None,
        })
        .unwrap();
    store
        .put_processor(&Processor {
            id: processor_id.to_string(),
            provider_id: "V1".to_string(),
            name: None,
        })
        .unwrap();
}

pub fn add_route(
    store: &StateStore,
    route_id: &str,
    state_id: &str,
    processor_id: &str,
    direction: ProcessorStateDirection,
) {
    add_processor(store, processor_id);
    store
        .put_route(&ProcessorStateRoute {
            id: route_id.to_string(),
            state_id: state_id.to_string(),
            processor_id: processor_id.to_string(),
            direction,
        })
        .unwrap();
}

pub fn message(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}
