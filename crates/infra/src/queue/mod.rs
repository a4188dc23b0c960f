//! Task queue with two independent lanes.
//!
//! Intake and the dispatcher enqueue; the worker pool receives, then acks a
//! task once handled or nacks it when its handler errored.
//! Imports and webhook work never share a lane, so a webhook backlog cannot
//! hold up imports and the other way round.
//!
//! Delivery is at-least-once: a task received but never acked may come back
//! (after a crash, on the Redis backend). Handlers are written to tolerate that.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use shelfsync_core::{JobId, SubscriptionId};

use crate::staging::StagedFile;
use crate::webhooks::DeliveryTask;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsTaskQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Imports,
    Webhooks,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Imports, Lane::Webhooks];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Imports => "imports",
            Lane::Webhooks => "webhooks",
        }
    }
}

impl core::fmt::Display for Lane {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Import { job_id: JobId, staged: StagedFile },
    WebhookDelivery(DeliveryTask),
    WebhookTest { job_id: JobId, subscription_id: SubscriptionId },
}

impl Task {
    pub fn lane(&self) -> Lane {
        match self {
            Task::Import { .. } => Lane::Imports,
            Task::WebhookDelivery(_) | Task::WebhookTest { .. } => Lane::Webhooks,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Import { .. } => "import",
            Task::WebhookDelivery(_) => "webhook_delivery",
            Task::WebhookTest { .. } => "webhook_test",
        }
    }
}

/// Backend handle used to ack a received task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A received task plus what the worker needs to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: Task,
    pub receipt: Receipt,
    /// How many times the broker has handed this entry out, including now.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("task serialization error: {0}")]
    Serialization(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make `task` available on its lane now.
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Make `task` available on its lane once `delay` has passed.
    async fn enqueue_after(&self, task: Task, delay: Duration) -> Result<(), QueueError>;

    /// Next task on `lane`, waiting up to `wait`. `None` when nothing arrived.
    async fn receive(&self, lane: Lane, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, lane: Lane, receipt: &Receipt) -> Result<(), QueueError>;

    /// Hand a received task back unacked so it is received again after
    /// `delay`. Backends that redeliver unacked entries on their own may
    /// redeliver later than `delay`.
    async fn nack(&self, lane: Lane, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_route_to_their_lane() {
        let test = Task::WebhookTest {
            job_id: JobId::new(),
            subscription_id: SubscriptionId::new(),
        };
        assert_eq!(test.lane(), Lane::Webhooks);

        let import = Task::Import {
            job_id: JobId::new(),
            staged: StagedFile {
                job_id: JobId::new(),
                key: "memory://x.csv".into(),
                size_bytes: 0,
                content_hash: String::new(),
            },
        };
        assert_eq!(import.lane(), Lane::Imports);
    }

    #[test]
    fn task_wire_format_is_tagged() {
        let job_id = JobId::new();
        let subscription_id = SubscriptionId::new();
        let task = Task::WebhookTest { job_id, subscription_id };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "webhook_test");

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
