//! In-process message bus.
//!
//! Every subject is a bounded FIFO queue. Subscriptions to the same subject
//! compete for messages, so each message is delivered to exactly one of
//! them. Delivered messages stay in flight until acknowledged; rejected
//! messages are requeued, optionally after a delay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::transport::{Delivery, MessageSink, MessageSource, TransportError, TransportResult};
use crate::DEFAULT_QUEUE_CAPACITY;

#[derive(Debug, Clone)]
struct Envelope {
    payload: Vec<u8>,
    redeliveries: u32,
}

/// One subject's queue plus its unacknowledged deliveries.
struct Queue {
    sender: mpsc::Sender<Envelope>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    in_flight: Mutex<HashMap<u64, Envelope>>,
    closed: watch::Sender<bool>,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            in_flight: Mutex::new(HashMap::new()),
            closed,
        }
    }

    fn take_in_flight(&self, tag: u64) -> Option<Envelope> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag)
    }
}

struct BusInner {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    capacity: usize,
    next_tag: AtomicU64,
    published: AtomicU64,
}

/// In-memory bus shared by cloning.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    /// Create a bus with the default per-subject capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus whose subjects hold at most `capacity` queued messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queues: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                next_tag: AtomicU64::new(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    fn queue(&self, subject: &str) -> Arc<Queue> {
        if let Some(queue) = self
            .inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
        {
            return queue.clone();
        }
        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(subject.to_string())
            .or_insert_with(|| {
                debug!(%subject, capacity = self.inner.capacity, "subject created");
                Arc::new(Queue::new(self.inner.capacity))
            })
            .clone()
    }

    /// Subscribe to a subject. Subscriptions to one subject share its queue.
    pub fn subscribe(&self, subject: &str) -> Subscription {
        Subscription {
            subject: subject.to_string(),
            queue: self.queue(subject),
            bus: self.inner.clone(),
        }
    }

    /// Stop delivering on every subject. Pending receives return `None` and
    /// later publishes fail with `Closed`.
    pub fn close(&self) {
        let queues = self
            .inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (subject, queue) in queues.iter() {
            queue.closed.send_replace(true);
            debug!(%subject, "subject closed");
        }
    }

    /// Messages queued and not yet delivered on a subject.
    pub fn depth(&self, subject: &str) -> usize {
        let queue = self.queue(subject);
        queue.sender.max_capacity() - queue.sender.capacity()
    }

    /// Messages delivered and not yet settled on a subject.
    pub fn in_flight(&self, subject: &str) -> usize {
        self.queue(subject)
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total messages accepted by `publish`.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSink for InMemoryBus {
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> TransportResult<()> {
        let queue = self.queue(destination);
        if *queue.closed.borrow() {
            return Err(TransportError::Closed(destination.to_string()));
        }
        queue
            .sender
            .try_send(Envelope {
                payload,
                redeliveries: 0,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Backpressure(destination.to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    TransportError::Closed(destination.to_string())
                }
            })?;
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        debug!(%destination, "message published");
        Ok(())
    }
}

/// A consumer handle on one subject.
pub struct Subscription {
    subject: String,
    queue: Arc<Queue>,
    bus: Arc<BusInner>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Take the next queued message without waiting.
    pub fn try_receive(&self) -> Option<Delivery> {
        if *self.queue.closed.borrow() {
            return None;
        }
        let envelope = {
            let mut receiver = self.queue.receiver.try_lock().ok()?;
            receiver.try_recv().ok()?
        };
        Some(self.deliver(envelope))
    }

    fn deliver(&self, envelope: Envelope) -> Delivery {
        let tag = self.bus.next_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            tag,
            subject: self.subject.clone(),
            payload: envelope.payload.clone(),
            redeliveries: envelope.redeliveries,
        };
        self.queue
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag, envelope);
        delivery
    }
}

#[async_trait]
impl MessageSource for Subscription {
    async fn receive(&self) -> TransportResult<Option<Delivery>> {
        let mut closed = self.queue.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut receiver = tokio::select! {
            guard = self.queue.receiver.lock() => guard,
            _ = closed.changed() => return Ok(None),
        };
        let envelope = tokio::select! {
            envelope = receiver.recv() => envelope,
            _ = closed.changed() => return Ok(None),
        };
        drop(receiver);

        match envelope {
            Some(envelope) => Ok(Some(self.deliver(envelope))),
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
        if self.queue.take_in_flight(delivery.tag).is_some() {
            debug!(subject = %self.subject, tag = delivery.tag, "message acknowledged");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> TransportResult<()> {
        let Some(mut envelope) = self.queue.take_in_flight(delivery.tag) else {
            return Ok(());
        };
        envelope.redeliveries += 1;
        debug!(
            subject = %self.subject,
            tag = delivery.tag,
            redeliveries = envelope.redeliveries,
            ?delay,
            "message requeued"
        );

        if delay.is_zero() {
            return self.queue.sender.try_send(envelope).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Backpressure(self.subject.clone())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed(self.subject.clone()),
            });
        }

        let sender = self.queue.sender.clone();
        let subject = self.subject.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(envelope).await.is_err() {
                warn!(%subject, "requeue dropped, subject closed");
            }
        });
        Ok(())
    }
}
