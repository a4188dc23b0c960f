//! Process-local queue for tests/dev. Tasks live only as long as the process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{Delivery, Lane, QueueError, Receipt, Task, TaskQueue};

/// A ready task and how many times it has been handed out before.
type Entry = (Task, u32);

#[derive(Debug, Default)]
struct LaneQueue {
    ready: Mutex<VecDeque<Entry>>,
    notify: Notify,
    in_flight: AtomicUsize,
    delayed: AtomicUsize,
}

impl LaneQueue {
    fn push(&self, task: Task, delivered: u32) -> Result<(), QueueError> {
        self.ready
            .lock()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))?
            .push_back((task, delivered));
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Result<Option<Entry>, QueueError> {
        Ok(self
            .ready
            .lock()
            .map_err(|_| QueueError::Backend("queue lock poisoned".to_string()))?
            .pop_front())
    }

    fn ready_len(&self) -> usize {
        self.ready.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Inner {
    imports: LaneQueue,
    webhooks: LaneQueue,
    next_receipt: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn lane(&self, lane: Lane) -> &LaneQueue {
        match lane {
            Lane::Imports => &self.imports,
            Lane::Webhooks => &self.webhooks,
        }
    }
}

/// In-memory two-lane queue. Cheap to clone; clones share the lanes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskQueue {
    inner: Arc<Inner>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Refuse further enqueues. Already queued tasks can still be received.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Tasks ready to be received on `lane`.
    pub fn ready(&self, lane: Lane) -> usize {
        self.inner.lane(lane).ready_len()
    }

    /// Received but not yet acked.
    pub fn in_flight(&self, lane: Lane) -> usize {
        self.inner.lane(lane).in_flight.load(Ordering::SeqCst)
    }

    /// Scheduled for later and not yet ready.
    pub fn delayed(&self, lane: Lane) -> usize {
        self.inner.lane(lane).delayed.load(Ordering::SeqCst)
    }

    /// Nothing ready, in flight or waiting on `lane`.
    pub fn is_idle(&self, lane: Lane) -> bool {
        self.ready(lane) == 0 && self.in_flight(lane) == 0 && self.delayed(lane) == 0
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("queue is closed".to_string()));
        }
        Ok(())
    }

    fn push_later(&self, task: Task, delivered: u32, delay: Duration) -> Result<(), QueueError> {
        let lane = task.lane();
        if delay.is_zero() {
            return self.inner.lane(lane).push(task, delivered);
        }

        let inner = self.inner.clone();
        inner.lane(lane).delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let queue = inner.lane(lane);
            if let Err(e) = queue.push(task, delivered) {
                debug!(lane = %lane, error = %e, "dropping delayed task");
            }
            queue.delayed.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    fn settle(&self, lane: Lane) {
        let _ = self
            .inner
            .lane(lane)
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.check_open()?;
        let lane = task.lane();
        debug!(lane = %lane, kind = task.kind(), "task enqueued");
        self.inner.lane(lane).push(task, 0)
    }

    async fn enqueue_after(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        self.check_open()?;
        self.push_later(task, 0, delay)
    }

    async fn receive(&self, lane: Lane, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let queue = self.inner.lane(lane);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = queue.notify.notified();
            if let Some((task, delivered)) = queue.pop()? {
                queue.in_flight.fetch_add(1, Ordering::SeqCst);
                let seq = self.inner.next_receipt.fetch_add(1, Ordering::SeqCst);
                return Ok(Some(Delivery {
                    task,
                    receipt: Receipt::new(format!("{lane}-{seq}")),
                    delivery_count: delivered + 1,
                }));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, lane: Lane, _receipt: &Receipt) -> Result<(), QueueError> {
        self.settle(lane);
        Ok(())
    }

    /// Fails while closed, leaving the task in flight.
    async fn nack(&self, lane: Lane, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        self.check_open()?;
        self.push_later(delivery.task.clone(), delivery.delivery_count, delay)?;
        self.settle(lane);
        debug!(lane = %lane, kind = delivery.task.kind(), delivery_count = delivery.delivery_count, "task handed back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfsync_core::{JobId, SubscriptionId};

    fn test_task() -> Task {
        Task::WebhookTest {
            job_id: JobId::new(),
            subscription_id: SubscriptionId::new(),
        }
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(test_task()).await.unwrap();

        let none = queue.receive(Lane::Imports, Duration::from_millis(10)).await.unwrap();
        assert!(none.is_none());

        let got = queue
            .receive(Lane::Webhooks, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.in_flight(Lane::Webhooks), 1);
        queue.ack(Lane::Webhooks, &got.receipt).await.unwrap();
        assert!(queue.is_idle(Lane::Webhooks));
    }

    #[tokio::test]
    async fn receive_wakes_on_enqueue() {
        let queue = InMemoryTaskQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Lane::Webhooks, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(test_task()).await.unwrap();

        assert!(waiter.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn delayed_tasks_become_ready_later() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue_after(test_task(), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(queue.delayed(Lane::Webhooks), 1);
        assert_eq!(queue.ready(Lane::Webhooks), 0);

        let got = queue.receive(Lane::Webhooks, Duration::from_secs(2)).await.unwrap();
        assert!(got.is_some());
        assert_eq!(queue.delayed(Lane::Webhooks), 0);
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue() {
        let queue = InMemoryTaskQueue::new();
        queue.close();
        assert!(matches!(
            queue.enqueue(test_task()).await,
            Err(QueueError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn nacked_task_comes_back_with_a_higher_count() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(test_task()).await.unwrap();
        let first = queue
            .receive(Lane::Webhooks, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.delivery_count, 1);

        queue.nack(Lane::Webhooks, &first, Duration::ZERO).await.unwrap();
        assert_eq!(queue.in_flight(Lane::Webhooks), 0);
        let second = queue
            .receive(Lane::Webhooks, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.task, first.task);
    }

    #[tokio::test]
    async fn closed_queue_refuses_nack() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(test_task()).await.unwrap();
        let got = queue
            .receive(Lane::Webhooks, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        queue.close();

        assert!(queue.nack(Lane::Webhooks, &got, Duration::ZERO).await.is_err());
        assert_eq!(queue.in_flight(Lane::Webhooks), 1);
    }
}
