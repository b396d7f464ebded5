//! Transport port: receive, acknowledge, reject and publish.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("destination closed: {0}")]
    Closed(String),

    #[error("destination full: {0}")]
    Backpressure(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl TransportError {
    /// Whether the consumer holding this transport must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_))
    }
}

/// One received message. Settle it with `ack` or `nack` on the source it
/// came from.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery tag, unique per bus.
    pub tag: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    /// How many times this message was rejected and requeued before.
    pub redeliveries: u32,
}

impl Delivery {
    /// Payload for log output.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Consuming side of a subscription.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message. `None` means the subscription ended.
    async fn receive(&self) -> TransportResult<Option<Delivery>>;

    /// Acknowledge a message. Acknowledging twice is a no-op.
    async fn ack(&self, delivery: &Delivery) -> TransportResult<()>;

    /// Reject a message and requeue it after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> TransportResult<()>;
}

/// Publishing side.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> TransportResult<()>;
}
