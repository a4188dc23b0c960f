//! Redis Streams-backed task queue (durable, at-least-once).
//!
//! ## Layout
//!
//! - **Lane stream**: `shelfsync:tasks:{lane}`, one entry per task
//! - **Consumer group**: `workers`, shared by every worker process
//! - **Delayed set**: `shelfsync:tasks:{lane}:delayed`, a sorted set scored by
//!   due time in epoch milliseconds; due members are moved onto the stream on
//!   every receive
//! - **Dead-letter stream**: `shelfsync:tasks:{lane}:dlq`, entries that were
//!   handed out more than `max_deliveries` times without an ack
//!
//! Entries are acked only after the worker finished with them. Entries left
//! pending longer than `pending_timeout` (a crashed worker) are claimed by the
//! next receiver.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use super::{Delivery, Lane, QueueError, Receipt, Task, TaskQueue};

const DEFAULT_KEY_PREFIX: &str = "shelfsync:tasks";
const DEFAULT_GROUP: &str = "workers";
const DEFAULT_MAX_DELIVERIES: u32 = 5;
const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(300);
const PROMOTE_BATCH: isize = 100;
const RECLAIM_BATCH: usize = 10;

/// Member stored in the delayed set. The nonce keeps identical tasks distinct.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedEntry {
    nonce: Uuid,
    task: Task,
}

#[derive(Debug, Clone)]
pub struct RedisStreamsTaskQueue {
    client: redis::Client,
    conn: MultiplexedConnection,
    key_prefix: String,
    group: String,
    consumer: String,
    max_deliveries: u32,
    pending_timeout: Duration,
}

fn command_error(what: &str) -> impl FnOnce(redis::RedisError) -> QueueError + '_ {
    move |e| {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            QueueError::Unavailable(format!("{what}: {e}"))
        } else {
            QueueError::Backend(format!("{what} failed: {e}"))
        }
    }
}

impl RedisStreamsTaskQueue {
    /// Connect and make sure each lane's stream and consumer group exist.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(command_error("connect"))?;

        let queue = Self {
            client,
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        };
        for lane in Lane::ALL {
            queue.ensure_consumer_group(lane).await?;
        }
        Ok(queue)
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    fn stream_key(&self, lane: Lane) -> String {
        format!("{}:{}", self.key_prefix, lane.as_str())
    }

    fn delayed_key(&self, lane: Lane) -> String {
        format!("{}:{}:delayed", self.key_prefix, lane.as_str())
    }

    fn dlq_key(&self, lane: Lane) -> String {
        format!("{}:{}:dlq", self.key_prefix, lane.as_str())
    }

    /// Idempotent: an existing group (BUSYGROUP) is fine.
    async fn ensure_consumer_group(&self, lane: Lane) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(lane))
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error("XGROUP CREATE")(e)),
        }
    }

    async fn add_to_stream(&self, lane: Lane, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(self.stream_key(lane), "*", &[("task", payload)])
            .await
            .map_err(command_error("XADD"))?;
        Ok(())
    }

    /// Move due members of the delayed set onto the lane stream.
    async fn promote_due(&self, lane: Lane) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.delayed_key(lane), "-inf", now_ms, 0, PROMOTE_BATCH)
            .await
            .map_err(command_error("ZRANGEBYSCORE"))?;

        for member in due {
            // Whoever removes the member owns the promotion.
            let removed: i64 = conn
                .zrem(self.delayed_key(lane), &member)
                .await
                .map_err(command_error("ZREM"))?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<DelayedEntry>(&member) {
                Ok(entry) => {
                    let payload = serde_json::to_string(&entry.task)
                        .map_err(|e| QueueError::Serialization(e.to_string()))?;
                    self.add_to_stream(lane, &payload).await?;
                }
                Err(e) => error!(lane = %lane, error = %e, "dropping undecodable delayed task"),
            }
        }
        Ok(())
    }

    /// Claim one entry left pending too long by a dead consumer.
    async fn reclaim_stale(&self, lane: Lane) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let stream = self.stream_key(lane);
        let min_idle_ms = u64::try_from(self.pending_timeout.as_millis()).unwrap_or(u64::MAX);

        let pending: StreamPendingCountReply = conn
            .xpending_count(&stream, &self.group, "-", "+", RECLAIM_BATCH)
            .await
            .map_err(command_error("XPENDING"))?;

        for entry in pending.ids {
            if (entry.last_delivered_ms as u64) < min_idle_ms {
                continue;
            }
            let times_delivered = u32::try_from(entry.times_delivered).unwrap_or(u32::MAX);
            if times_delivered >= self.max_deliveries {
                self.dead_letter(lane, &entry.id, times_delivered, "delivery ceiling reached")
                    .await?;
                continue;
            }

            let claimed: StreamClaimReply = conn
                .xclaim(&stream, &self.group, &self.consumer, min_idle_ms, &[&entry.id])
                .await
                .map_err(command_error("XCLAIM"))?;
            if let Some(stream_id) = claimed.ids.into_iter().next() {
                warn!(lane = %lane, entry_id = %stream_id.id, times_delivered, "reclaimed stale task");
                if let Some(delivery) = self.decode(lane, stream_id, times_delivered + 1).await? {
                    return Ok(Some(delivery));
                }
            }
        }
        Ok(None)
    }

    /// Copy the entry to the DLQ stream and ack it on the lane.
    async fn dead_letter(&self, lane: Lane, entry_id: &str, times_delivered: u32, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let stream = self.stream_key(lane);
        let range: redis::streams::StreamRangeReply = conn
            .xrange(&stream, entry_id, entry_id)
            .await
            .map_err(command_error("XRANGE"))?;
        let payload: String = range
            .ids
            .first()
            .and_then(|id| id.get("task"))
            .unwrap_or_default();

        let _: String = conn
            .xadd(
                self.dlq_key(lane),
                "*",
                &[
                    ("original_entry_id", entry_id.to_string()),
                    ("times_delivered", times_delivered.to_string()),
                    ("reason", reason.to_string()),
                    ("failed_at", Utc::now().to_rfc3339()),
                    ("task", payload),
                ],
            )
            .await
            .map_err(command_error("DLQ XADD"))?;
        let _: i64 = conn
            .xack(&stream, &self.group, &[entry_id])
            .await
            .map_err(command_error("XACK"))?;

        error!(lane = %lane, entry_id, times_delivered, reason, "task moved to dead-letter stream");
        Ok(())
    }

    async fn decode(&self, lane: Lane, entry: StreamId, delivery_count: u32) -> Result<Option<Delivery>, QueueError> {
        let payload: Option<String> = entry.get("task");
        match payload.as_deref().map(serde_json::from_str::<Task>) {
            Some(Ok(task)) => Ok(Some(Delivery {
                task,
                receipt: Receipt::new(entry.id),
                delivery_count,
            })),
            Some(Err(e)) => {
                self.dead_letter(lane, &entry.id, delivery_count, &format!("undecodable task: {e}"))
                    .await?;
                Ok(None)
            }
            None => {
                self.dead_letter(lane, &entry.id, delivery_count, "missing task field").await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TaskQueue for RedisStreamsTaskQueue {
    #[instrument(skip(self, task), fields(lane = %task.lane(), kind = task.kind()), err)]
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&task).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.add_to_stream(task.lane(), &payload).await
    }

    #[instrument(skip(self, task), fields(lane = %task.lane(), kind = task.kind(), delay_ms = delay.as_millis() as u64), err)]
    async fn enqueue_after(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.enqueue(task).await;
        }
        let lane = task.lane();
        let member = serde_json::to_string(&DelayedEntry {
            nonce: Uuid::now_v7(),
            task,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let due_ms = Utc::now().timestamp_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(self.delayed_key(lane), member, due_ms)
            .await
            .map_err(command_error("ZADD"))?;
        Ok(())
    }

    async fn receive(&self, lane: Lane, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.promote_due(lane).await?;

        if let Some(delivery) = self.reclaim_stale(lane).await? {
            return Ok(Some(delivery));
        }

        // BLOCK would stall every other command on a shared multiplexed
        // connection, so blocking reads get their own.
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(command_error("connect"))?;
        let block_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(self.stream_key(lane))
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(command_error("XREADGROUP"))?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();
        match entry {
            Some(entry) => self.decode(lane, entry, 1).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(lane = %lane, receipt = receipt.as_str()), err)]
    async fn ack(&self, lane: Lane, receipt: &Receipt) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(self.stream_key(lane), &self.group, &[receipt.as_str()])
            .await
            .map_err(command_error("XACK"))?;
        Ok(())
    }

    /// Leaves the entry pending. It is reclaimed once idle past
    /// `pending_timeout`, or dead-lettered at `max_deliveries`.
    #[instrument(skip(self, delivery), fields(lane = %lane, receipt = delivery.receipt.as_str()))]
    async fn nack(&self, lane: Lane, delivery: &Delivery, _delay: Duration) -> Result<(), QueueError> {
        warn!(
            delivery_count = delivery.delivery_count,
            pending_timeout_ms = u64::try_from(self.pending_timeout.as_millis()).unwrap_or(u64::MAX),
            "task left pending for redelivery"
        );
        Ok(())
    }
}
