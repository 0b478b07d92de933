//! Message bus abstraction (mechanics only).
//!
//! At-least-once delivery with manual acknowledgement. Subscriptions are
//! *shared*: every subscriber bearing the same subscription name load-balances
//! one queue, so horizontal replicas do not duplicate work. A delivery that is
//! neither ack'd nor nack'd is redelivered when its lease lapses; consumers
//! must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker rejected or never saw the message. The caller decides
    /// whether to retry or degrade.
    #[error("broker unavailable: {0}")]
    Broker(String),

    #[error("payload encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("broker unavailable: {0}")]
    Broker(String),
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The subscription was closed; no further deliveries will arrive.
    #[error("subscription closed")]
    Closed,
}

/// Outcome of settling a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Ack,
    Nack,
}

/// One received message, owning its acknowledgement.
///
/// Dropping an unsettled delivery nacks it, which models the broker lease
/// expiring: the message goes back for redelivery rather than being lost.
pub struct Delivery {
    message_id: String,
    topic: String,
    payload: Vec<u8>,
    attempts: u32,
    settler: Option<Box<dyn FnOnce(Settle) + Send>>,
}

impl Delivery {
    pub fn new(
        message_id: impl Into<String>,
        topic: impl Into<String>,
        payload: Vec<u8>,
        attempts: u32,
        settler: Box<dyn FnOnce(Settle) + Send>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            topic: topic.into(),
            payload,
            attempts,
            settler: Some(settler),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Delivery count, starting at 1 for the first attempt.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Confirm processing; the broker forgets the message.
    pub fn ack(mut self) {
        if let Some(settle) = self.settler.take() {
            settle(Settle::Ack);
        }
    }

    /// Reject processing; the broker redelivers.
    pub fn nack(mut self) {
        if let Some(settle) = self.settler.take() {
            settle(Settle::Nack);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(settle) = self.settler.take() {
            settle(Settle::Nack);
        }
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Transport-specific receive half of a subscription.
#[async_trait]
pub trait MessageStream: Send {
    /// Wait for the next delivery. Blocks until a message arrives or the
    /// subscription closes.
    async fn recv(&mut self) -> Result<Delivery, ReceiveError>;
}

/// A handle to a shared subscription.
pub struct BusSubscription {
    inner: Box<dyn MessageStream>,
}

impl BusSubscription {
    pub fn new(inner: Box<dyn MessageStream>) -> Self {
        Self { inner }
    }

    /// Block until the next delivery is available.
    pub async fn recv(&mut self) -> Result<Delivery, ReceiveError> {
        self.inner.recv().await
    }

    /// Wait up to `lease` for a delivery; `Ok(None)` on timeout.
    ///
    /// Consumer loops use this as their cancellation boundary: each lease
    /// lapse is a chance to observe shutdown.
    pub async fn recv_timeout(&mut self, lease: Duration) -> Result<Option<Delivery>, ReceiveError> {
        match tokio::time::timeout(lease, self.inner.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl core::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusSubscription").finish_non_exhaustive()
    }
}

/// Domain-agnostic message bus.
///
/// Payloads are opaque byte blobs; encoding is the codec's concern. The trait
/// is object-safe so wiring code can hold `Arc<dyn MessageBus>`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    async fn subscribe(
        &self,
        topic: &str,
        subscription_name: &str,
    ) -> Result<BusSubscription, SubscribeError>;

    /// Liveness probe for the operational surface.
    async fn ping(&self) -> bool {
        true
    }
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        (**self).publish(topic, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription_name: &str,
    ) -> Result<BusSubscription, SubscribeError> {
        (**self).subscribe(topic, subscription_name).await
    }

    async fn ping(&self) -> bool {
        (**self).ping().await
    }
}
