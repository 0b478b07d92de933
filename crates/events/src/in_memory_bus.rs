//! In-memory message bus for tests/dev.
//!
//! - No IO; queues live in process memory
//! - Shared subscriptions load-balance one queue per `(topic, subscription)`
//! - Nack (or dropping a delivery unsettled) requeues with a bumped attempt
//!   count; messages past the redelivery cap land in a dead-letter queue

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use crate::bus::{
    BusSubscription, Delivery, MessageBus, MessageStream, PublishError, ReceiveError, Settle,
    SubscribeError,
};

const DEFAULT_MAX_REDELIVERIES: u32 = 16;

#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: String,
    payload: Vec<u8>,
    attempts: u32,
}

/// One load-balanced queue shared by every subscriber with the same name.
#[derive(Debug, Default)]
struct SharedQueue {
    ready: Mutex<VecDeque<QueuedMessage>>,
    dead: Mutex<Vec<QueuedMessage>>,
    notify: Notify,
}

impl SharedQueue {
    fn enqueue(&self, message: QueuedMessage) {
        self.ready
            .lock()
            .expect("in-memory bus queue lock poisoned")
            .push_back(message);
        self.notify.notify_one();
    }

    fn requeue_front(&self, message: QueuedMessage) {
        self.ready
            .lock()
            .expect("in-memory bus queue lock poisoned")
            .push_front(message);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<QueuedMessage> {
        self.ready
            .lock()
            .expect("in-memory bus queue lock poisoned")
            .pop_front()
    }

    fn bury(&self, message: QueuedMessage) {
        warn!(
            message_id = %message.message_id,
            attempts = message.attempts,
            "message exceeded redelivery cap, moving to dead letters"
        );
        self.dead
            .lock()
            .expect("in-memory bus dead-letter lock poisoned")
            .push(message);
    }
}

#[derive(Default)]
struct TopicState {
    /// subscription name → shared queue
    subscriptions: HashMap<String, Arc<SharedQueue>>,
}

/// In-memory pub/sub bus with manual acknowledgement.
///
/// Distinct subscription names each see every message (fan-out); subscribers
/// sharing a name steal from one queue (load-balancing). Messages published
/// to a topic nobody has subscribed to yet are dropped, as with a broker
/// whose subscriptions are created by consumers; tests subscribe first.
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, TopicState>>,
    max_redeliveries: u32,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }

    /// Cap redeliveries (tests exercising poison messages keep this low).
    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            max_redeliveries,
        }
    }

    /// Dead-lettered payloads for a subscription, for test assertions.
    pub fn dead_letters(&self, topic: &str, subscription_name: &str) -> Vec<Vec<u8>> {
        let topics = self.topics.lock().expect("in-memory bus topic lock poisoned");
        topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription_name))
            .map(|q| {
                q.dead
                    .lock()
                    .expect("in-memory bus dead-letter lock poisoned")
                    .iter()
                    .map(|m| m.payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn queue_for(&self, topic: &str, subscription_name: &str) -> Arc<SharedQueue> {
        let mut topics = self.topics.lock().expect("in-memory bus topic lock poisoned");
        let state = topics.entry(topic.to_string()).or_default();
        state
            .subscriptions
            .entry(subscription_name.to_string())
            .or_default()
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let queues: Vec<Arc<SharedQueue>> = {
            let topics = self
                .topics
                .lock()
                .map_err(|_| PublishError::Broker("topic lock poisoned".to_string()))?;
            topics
                .get(topic)
                .map(|t| t.subscriptions.values().cloned().collect())
                .unwrap_or_default()
        };

        for queue in queues {
            queue.enqueue(QueuedMessage {
                message_id: Uuid::now_v7().to_string(),
                payload: payload.clone(),
                attempts: 1,
            });
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription_name: &str,
    ) -> Result<BusSubscription, SubscribeError> {
        let queue = self.queue_for(topic, subscription_name);
        Ok(BusSubscription::new(Box::new(InMemorySubscription {
            topic: topic.to_string(),
            queue,
            max_redeliveries: self.max_redeliveries,
        })))
    }
}

struct InMemorySubscription {
    topic: String,
    queue: Arc<SharedQueue>,
    max_redeliveries: u32,
}

#[async_trait]
impl MessageStream for InMemorySubscription {
    async fn recv(&mut self) -> Result<Delivery, ReceiveError> {
        loop {
            // Register interest before checking the queue so a concurrent
            // enqueue cannot slip between the check and the wait.
            let notified = self.queue.notify.notified();

            if let Some(message) = self.queue.try_pop() {
                return Ok(self.make_delivery(message));
            }

            notified.await;
        }
    }
}

impl InMemorySubscription {
    fn make_delivery(&self, message: QueuedMessage) -> Delivery {
        let queue = Arc::clone(&self.queue);
        let max_redeliveries = self.max_redeliveries;
        let redelivery = message.clone();

        Delivery::new(
            message.message_id,
            self.topic.clone(),
            message.payload,
            message.attempts,
            Box::new(move |settle| {
                if settle == Settle::Nack {
                    let mut next = redelivery;
                    next.attempts += 1;
                    if next.attempts > max_redeliveries {
                        queue.bury(next);
                    } else {
                        queue.requeue_front(next);
                    }
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_subscriptions_each_receive_every_message() {
        let bus = InMemoryBus::new();
        let mut sub_a = bus.subscribe("t", "group-a").await.unwrap();
        let mut sub_b = bus.subscribe("t", "group-b").await.unwrap();

        bus.publish("t", b"m1".to_vec()).await.unwrap();

        let a = sub_a.recv().await.unwrap();
        let b = sub_b.recv().await.unwrap();
        assert_eq!(a.payload(), b"m1");
        assert_eq!(b.payload(), b"m1");
        a.ack();
        b.ack();
    }

    #[tokio::test]
    async fn shared_subscription_load_balances_one_queue() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe("t", "group").await.unwrap();
        let mut second = bus.subscribe("t", "group").await.unwrap();

        bus.publish("t", b"m1".to_vec()).await.unwrap();
        bus.publish("t", b"m2".to_vec()).await.unwrap();

        // Two messages, two consumers sharing one queue: each message is
        // delivered exactly once across the group.
        let d1 = first.recv().await.unwrap();
        let d2 = second.recv().await.unwrap();
        let mut seen = vec![d1.payload().to_vec(), d2.payload().to_vec()];
        seen.sort();
        assert_eq!(seen, vec![b"m1".to_vec(), b"m2".to_vec()]);
        d1.ack();
        d2.ack();

        // Nothing left for either consumer.
        let empty = first
            .recv_timeout(std::time::Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn nack_redelivers_with_bumped_attempts() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("t", "group").await.unwrap();

        bus.publish("t", b"m1".to_vec()).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.attempts(), 1);
        first.nack();

        let second = sub.recv().await.unwrap();
        assert_eq!(second.attempts(), 2);
        assert_eq!(second.payload(), b"m1");
        second.ack();
    }

    #[tokio::test]
    async fn dropping_unsettled_delivery_redelivers() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("t", "group").await.unwrap();

        bus.publish("t", b"m1".to_vec()).await.unwrap();

        {
            let _dropped = sub.recv().await.unwrap();
            // lease lapses without ack/nack
        }

        let redelivered = sub.recv().await.unwrap();
        assert_eq!(redelivered.attempts(), 2);
        redelivered.ack();
    }

    #[tokio::test]
    async fn poison_messages_land_in_dead_letters() {
        let bus = InMemoryBus::with_max_redeliveries(2);
        let mut sub = bus.subscribe("t", "group").await.unwrap();

        bus.publish("t", b"poison".to_vec()).await.unwrap();

        sub.recv().await.unwrap().nack();
        sub.recv().await.unwrap().nack();

        let empty = sub
            .recv_timeout(std::time::Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_none());
        assert_eq!(bus.dead_letters("t", "group"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = InMemoryBus::new();
        bus.publish("t", b"m1".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("t", "group").await.unwrap();
        let empty = sub
            .recv_timeout(std::time::Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_none());
    }
}
