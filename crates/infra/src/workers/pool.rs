//! Lane-based worker pool.
//!
//! Each lane gets its own set of tokio tasks pulling from the queue, so a
//! slow import never delays webhook traffic and the other way round.
//!
//! A task is acked once its handler has finished with it. When the handler
//! errors (a store or the queue unreachable) the task is nacked and comes
//! back later; after `max_deliveries` attempts, or when it cannot be handed
//! back, the task is abandoned: its job is failed, the failure is logged and
//! the task is acked.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::import::{ImportError, ImportWorker};
use crate::jobs::{JobStatus, JobStoreError};
use crate::queue::{Delivery, Lane, Receipt, Task, TaskQueue};
use crate::webhooks::{DeliveryReport, DispatchError, WebhookDispatcher};

const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELIVERIES: u32 = 5;
const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub import_workers: usize,
    pub webhook_workers: usize,
    /// How long one receive waits before re-checking for shutdown.
    pub receive_wait: Duration,
    /// Deliveries of one task before an erroring task is abandoned.
    pub max_deliveries: u32,
    /// Wait before a nacked task is received again.
    pub redelivery_delay: Duration,
    /// Prefix for worker names in logs.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            import_workers: 2,
            webhook_workers: 8,
            receive_wait: DEFAULT_RECEIVE_WAIT,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
            name: "shelfsync".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_import_workers(mut self, n: usize) -> Self {
        self.import_workers = n;
        self
    }

    pub fn with_webhook_workers(mut self, n: usize) -> Self {
        self.webhook_workers = n;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub tasks_processed: u64,
    pub imports_completed: u64,
    pub imports_failed: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_retried: u64,
    pub deliveries_rejected: u64,
    pub deliveries_exhausted: u64,
    pub deliveries_skipped: u64,
    pub tests_completed: u64,
    pub tests_failed: u64,
    /// Handler errors (store or queue unreachable), not job failures.
    pub handler_errors: u64,
    /// Tasks nacked after a handler error.
    pub tasks_requeued: u64,
    /// Tasks given up on after repeated handler errors.
    pub tasks_abandoned: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default)]
struct SharedStats(Arc<Mutex<PoolStats>>);

impl SharedStats {
    fn update(&self, f: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut stats) = self.0.lock() {
            f(&mut stats);
        }
    }

    fn snapshot(&self) -> PoolStats {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Signal every worker and wait for the tasks in hand to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.snapshot();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }
}

struct PoolContext {
    queue: Arc<dyn TaskQueue>,
    importer: ImportWorker,
    dispatcher: WebhookDispatcher,
    receive_wait: Duration,
    max_deliveries: u32,
    redelivery_delay: Duration,
    stats: SharedStats,
}

pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    importer: ImportWorker,
    dispatcher: WebhookDispatcher,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn TaskQueue>, importer: ImportWorker, dispatcher: WebhookDispatcher) -> Self {
        Self {
            queue,
            importer,
            dispatcher,
        }
    }

    /// Start the workers on the current tokio runtime.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = SharedStats::default();
        let ctx = Arc::new(PoolContext {
            queue: self.queue,
            importer: self.importer,
            dispatcher: self.dispatcher,
            receive_wait: config.receive_wait,
            max_deliveries: config.max_deliveries.max(1),
            redelivery_delay: config.redelivery_delay,
            stats: stats.clone(),
        });

        let lanes = [
            (Lane::Imports, config.import_workers),
            (Lane::Webhooks, config.webhook_workers),
        ];
        let mut joins = Vec::new();
        for (lane, count) in lanes {
            for idx in 0..count {
                let name = format!("{}-{}-{}", config.name, lane.as_str(), idx);
                joins.push(tokio::spawn(worker_loop(name, lane, ctx.clone(), shutdown_rx.clone())));
            }
        }
        info!(
            pool = %config.name,
            import_workers = config.import_workers,
            webhook_workers = config.webhook_workers,
            "worker pool started"
        );

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop(name: String, lane: Lane, ctx: Arc<PoolContext>, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = %name, lane = %lane, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = ctx.queue.receive(lane, ctx.receive_wait) => received,
        };

        match received {
            Ok(Some(delivery)) => {
                ctx.stats.update(|s| s.current_running += 1);
                let handled = handle_task(&name, &ctx, delivery.task.clone()).await;
                ctx.stats.update(|s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.tasks_processed += 1;
                });
                match handled {
                    Handled::Done => ack(&name, &ctx, lane, &delivery.receipt).await,
                    Handled::Errored(reason) => retry_or_abandon(&name, &ctx, lane, delivery, reason).await,
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker = %name, lane = %lane, error = %e, "failed to receive task");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }

    debug!(worker = %name, lane = %lane, "worker stopped");
}

/// How a handler finished with a task.
enum Handled {
    /// Nothing left to do for this task.
    Done,
    /// The handler errored; the task may succeed if run again.
    Errored(String),
}

async fn ack(name: &str, ctx: &PoolContext, lane: Lane, receipt: &Receipt) {
    if let Err(e) = ctx.queue.ack(lane, receipt).await {
        error!(worker = %name, error = %e, "failed to ack task");
    }
}

async fn retry_or_abandon(name: &str, ctx: &PoolContext, lane: Lane, delivery: Delivery, reason: String) {
    if delivery.delivery_count < ctx.max_deliveries {
        match ctx.queue.nack(lane, &delivery, ctx.redelivery_delay).await {
            Ok(()) => {
                warn!(
                    worker = %name,
                    kind = delivery.task.kind(),
                    delivery_count = delivery.delivery_count,
                    "task handed back for redelivery"
                );
                ctx.stats.update(|s| s.tasks_requeued += 1);
                return;
            }
            Err(e) => error!(worker = %name, error = %e, "failed to hand task back"),
        }
    }

    abandon(name, ctx, &delivery.task, &reason).await;
    ctx.stats.update(|s| s.tasks_abandoned += 1);
    ack(name, ctx, lane, &delivery.receipt).await;
}

async fn abandon(name: &str, ctx: &PoolContext, task: &Task, reason: &str) {
    error!(worker = %name, kind = task.kind(), reason, "abandoning task");
    match task {
        Task::Import { job_id, staged } => {
            if let Some(job) = ctx.importer.abandon(*job_id, staged, reason).await {
                if job.status == JobStatus::Failed {
                    ctx.stats.update(|s| s.imports_failed += 1);
                }
            }
        }
        Task::WebhookDelivery(delivery) => {
            ctx.dispatcher.abandon_delivery(delivery, reason);
            ctx.stats.update(|s| s.deliveries_exhausted += 1);
        }
        Task::WebhookTest { job_id, subscription_id } => {
            if ctx
                .dispatcher
                .abandon_test(*job_id, *subscription_id, reason)
                .await
                .is_some()
            {
                ctx.stats.update(|s| s.tests_failed += 1);
            }
        }
    }
}

async fn handle_task(name: &str, ctx: &PoolContext, task: Task) -> Handled {
    match task {
        Task::Import { job_id, staged } => match ctx.importer.process(job_id, &staged).await {
            Ok(job) => {
                ctx.stats.update(|s| match job.status {
                    JobStatus::Completed => s.imports_completed += 1,
                    JobStatus::Failed => s.imports_failed += 1,
                    _ => {}
                });
                Handled::Done
            }
            Err(ImportError::Jobs(JobStoreError::NotFound(_))) => {
                error!(worker = %name, job_id = %job_id, "import task for unknown job dropped");
                ctx.stats.update(|s| s.handler_errors += 1);
                Handled::Done
            }
            Err(e) => {
                error!(worker = %name, job_id = %job_id, error = %e, "import task errored");
                ctx.stats.update(|s| s.handler_errors += 1);
                Handled::Errored(e.to_string())
            }
        },
        Task::WebhookDelivery(delivery) => {
            let delivery_id = delivery.delivery_id;
            match ctx.dispatcher.deliver(delivery).await {
                Ok(report) => {
                    ctx.stats.update(|s| match report {
                        DeliveryReport::Delivered { .. } => s.deliveries_succeeded += 1,
                        DeliveryReport::Rejected { .. } => s.deliveries_rejected += 1,
                        DeliveryReport::RetryScheduled { .. } => s.deliveries_retried += 1,
                        DeliveryReport::Exhausted { .. } => s.deliveries_exhausted += 1,
                        DeliveryReport::Skipped => s.deliveries_skipped += 1,
                    });
                    Handled::Done
                }
                Err(e) => {
                    error!(worker = %name, delivery_id = %delivery_id, error = %e, "delivery task errored");
                    ctx.stats.update(|s| s.handler_errors += 1);
                    Handled::Errored(e.to_string())
                }
            }
        }
        Task::WebhookTest { job_id, subscription_id } => {
            match ctx.dispatcher.run_test(job_id, subscription_id).await {
                Ok(job) => {
                    ctx.stats.update(|s| match job.status {
                        JobStatus::Completed => s.tests_completed += 1,
                        JobStatus::Failed => s.tests_failed += 1,
                        _ => {}
                    });
                    Handled::Done
                }
                Err(DispatchError::Jobs(JobStoreError::NotFound(_))) => {
                    error!(worker = %name, job_id = %job_id, "webhook test task for unknown job dropped");
                    ctx.stats.update(|s| s.handler_errors += 1);
                    Handled::Done
                }
                Err(e) => {
                    error!(worker = %name, job_id = %job_id, error = %e, "webhook test task errored");
                    ctx.stats.update(|s| s.handler_errors += 1);
                    Handled::Errored(e.to_string())
                }
            }
        }
    }
}
