//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! - **Streams**: one per topic, keyed `{prefix}:{topic}` (XADD)
//! - **Shared subscriptions**: consumer groups; every subscriber bearing the
//!   same subscription name joins one group and load-balances its deliveries
//! - **Manual acknowledgement**: ack → XACK; nack → the entry stays in the
//!   pending list and is reclaimed once its idle time passes the lease
//! - **Redelivery count**: taken from the pending-entry delivery counter
//!
//! Each subscription runs a background poll thread (the redis client is
//! blocking) that bridges deliveries into an async channel.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use partnerflow_events::{
    BusSubscription, Delivery, MessageBus, MessageStream, PublishError, ReceiveError, Settle,
    SubscribeError,
};

const DEFAULT_STREAM_PREFIX: &str = "partnerflow";

/// Pending entries idle longer than this are reclaimed for redelivery.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

/// Blocking window of each XREADGROUP poll.
const POLL_BLOCK_MS: u64 = 500;

/// Max messages fetched per poll.
const READ_COUNT: usize = 10;

#[derive(Debug, Clone)]
pub struct RedisStreamsBus {
    client: Arc<redis::Client>,
    stream_prefix: String,
    pending_timeout_ms: u64,
}

impl RedisStreamsBus {
    /// Connect to Redis (lazily; connections open per operation).
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_prefix: Option<String>,
    ) -> Result<Self, SubscribeError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| SubscribeError::Broker(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_prefix: stream_prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        })
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.stream_prefix, topic)
    }

    /// Create the consumer group if it does not exist (idempotent).
    fn ensure_consumer_group(&self, stream_key: &str, group: &str) -> Result<(), SubscribeError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| SubscribeError::Broker(e.to_string()))?;

        // MKSTREAM creates the stream if needed; BUSYGROUP means the group
        // already exists and is not an error.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(SubscribeError::Broker(e.to_string())),
        }
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let client = Arc::clone(&self.client);
        let key = self.stream_key(topic);

        // The redis client is blocking; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| PublishError::Broker(e.to_string()))?;

            let _: String = redis::cmd("XADD")
                .arg(&key)
                .arg("*")
                .arg("payload")
                .arg(payload.as_slice())
                .query(&mut conn)
                .map_err(|e| PublishError::Broker(format!("XADD failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| PublishError::Broker(format!("publish task failed: {e}")))?
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription_name: &str,
    ) -> Result<BusSubscription, SubscribeError> {
        let stream_key = self.stream_key(topic);
        self.ensure_consumer_group(&stream_key, subscription_name)?;

        let (delivery_tx, delivery_rx) = tokio::sync::mpsc::unbounded_channel();
        let (settle_tx, settle_rx) = std_mpsc::channel::<(String, Settle)>();

        let poller = Poller {
            client: Arc::clone(&self.client),
            stream_key,
            group: subscription_name.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            pending_timeout_ms: self.pending_timeout_ms,
            delivery_tx,
            settle_rx,
        };
        std::thread::spawn(move || poller.run());

        Ok(BusSubscription::new(Box::new(RedisSubscription {
            topic: topic.to_string(),
            delivery_rx,
            settle_tx,
        })))
    }

    async fn ping(&self) -> bool {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            client
                .get_connection()
                .and_then(|mut conn| redis::cmd("PING").query::<String>(&mut conn))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

struct RedisMessage {
    message_id: String,
    payload: Vec<u8>,
    attempts: u32,
}

/// Background thread: reads claimed + new entries, forwards them to the
/// subscription, and applies settlements (XACK on ack; nacked entries stay
/// pending until their idle time passes the lease).
struct Poller {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    pending_timeout_ms: u64,
    delivery_tx: tokio::sync::mpsc::UnboundedSender<RedisMessage>,
    settle_rx: std_mpsc::Receiver<(String, Settle)>,
}

impl Poller {
    fn run(self) {
        info!(
            stream = %self.stream_key,
            group = %self.group,
            consumer = %self.consumer,
            "redis streams poller started"
        );

        let mut conn = loop {
            match self.client.get_connection() {
                Ok(conn) => break conn,
                Err(e) => {
                    error!(error = %e, "redis connection failed, retrying");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        };

        loop {
            if self.apply_settlements(&mut conn).is_err() {
                return; // subscription dropped
            }

            let mut batch = Vec::new();
            match self.claim_timed_out(&mut conn) {
                Ok(claimed) => batch.extend(claimed),
                Err(e) => warn!(error = %e, "claiming pending entries failed"),
            }
            if batch.is_empty() {
                match self.read_new(&mut conn) {
                    Ok(fresh) => batch.extend(fresh),
                    Err(e) => {
                        warn!(error = %e, "reading stream failed, retrying");
                        std::thread::sleep(Duration::from_millis(POLL_BLOCK_MS));
                    }
                }
            }

            for message in batch {
                if self.delivery_tx.send(message).is_err() {
                    info!(stream = %self.stream_key, "subscription dropped, poller exiting");
                    return;
                }
            }
        }
    }

    /// Drain settlements; XACK the acks. Returns Err when the subscription
    /// side is gone.
    fn apply_settlements(&self, conn: &mut redis::Connection) -> Result<(), ()> {
        loop {
            match self.settle_rx.try_recv() {
                Ok((message_id, Settle::Ack)) => {
                    let acked: redis::RedisResult<u64> = redis::cmd("XACK")
                        .arg(&self.stream_key)
                        .arg(&self.group)
                        .arg(&message_id)
                        .query(conn);
                    if let Err(e) = acked {
                        warn!(message_id, error = %e, "XACK failed, entry will redeliver");
                    }
                }
                // Nack: leave the entry pending; it redelivers via claim
                // once its idle time passes the lease.
                Ok((_, Settle::Nack)) => {}
                Err(std_mpsc::TryRecvError::Empty) => return Ok(()),
                Err(std_mpsc::TryRecvError::Disconnected) => return Err(()),
            }
        }
    }

    /// Reclaim entries whose consumer went quiet (crash, lost lease).
    fn claim_timed_out(
        &self,
        conn: &mut redis::Connection,
    ) -> redis::RedisResult<Vec<RedisMessage>> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(READ_COUNT)
            .query(conn)?;

        let stale: Vec<(String, u64)> = pending
            .into_iter()
            .filter(|(_, _, idle_ms, _)| *idle_ms >= self.pending_timeout_ms)
            .map(|(id, _, _, delivery_count)| (id, delivery_count))
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = stale.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.pending_timeout_ms)
            .arg(&ids)
            .query(conn)?;

        let mut messages = parse_entries(&claimed);
        for message in &mut messages {
            // The claim itself counts as a delivery.
            if let Some((_, count)) = stale.iter().find(|(id, _)| *id == message.message_id) {
                message.attempts = (*count as u32).saturating_add(1);
            }
        }
        Ok(messages)
    }

    fn read_new(&self, conn: &mut redis::Connection) -> redis::RedisResult<Vec<RedisMessage>> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(POLL_BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)?;

        // Reply shape: [[stream_key, [entry, ...]], ...]; Nil on timeout.
        let mut messages = Vec::new();
        if let redis::Value::Bulk(streams) = reply {
            for stream in streams {
                if let redis::Value::Bulk(parts) = stream {
                    if let Some(entries) = parts.get(1) {
                        messages.extend(parse_entries(entries));
                    }
                }
            }
        }
        Ok(messages)
    }
}

/// Parse XREADGROUP/XCLAIM entries: `[id, [field, value, ...]]`.
fn parse_entries(value: &redis::Value) -> Vec<RedisMessage> {
    let redis::Value::Bulk(entries) = value else {
        return Vec::new();
    };

    let mut messages = Vec::new();
    for entry in entries {
        let redis::Value::Bulk(parts) = entry else {
            continue;
        };
        let Some(redis::Value::Data(id)) = parts.first() else {
            continue;
        };
        let Some(redis::Value::Bulk(fields)) = parts.get(1) else {
            continue;
        };

        let mut payload = None;
        for pair in fields.chunks(2) {
            if let [redis::Value::Data(key), redis::Value::Data(value)] = pair {
                if key.as_slice() == b"payload" {
                    payload = Some(value.clone());
                }
            }
        }

        match payload {
            Some(payload) => messages.push(RedisMessage {
                message_id: String::from_utf8_lossy(id).to_string(),
                payload,
                attempts: 1,
            }),
            None => warn!("stream entry without payload field, skipping"),
        }
    }
    messages
}

struct RedisSubscription {
    topic: String,
    delivery_rx: tokio::sync::mpsc::UnboundedReceiver<RedisMessage>,
    settle_tx: std_mpsc::Sender<(String, Settle)>,
}

#[async_trait]
impl MessageStream for RedisSubscription {
    async fn recv(&mut self) -> Result<Delivery, ReceiveError> {
        let message = self.delivery_rx.recv().await.ok_or(ReceiveError::Closed)?;

        let settle_tx = self.settle_tx.clone();
        let message_id = message.message_id.clone();
        Ok(Delivery::new(
            message.message_id,
            self.topic.clone(),
            message.payload,
            message.attempts,
            Box::new(move |settle| {
                let _ = settle_tx.send((message_id, settle));
            }),
        ))
    }
}
