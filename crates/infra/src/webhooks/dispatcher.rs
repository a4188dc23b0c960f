//! Fan-out, delivery and retry scheduling for catalog events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shelfsync_catalog::ProductRecord;
use shelfsync_core::{JobId, SubscriptionId};
use shelfsync_events::{CatalogEvent, DeliveryPayload};

use crate::catalog::Upserted;
use crate::jobs::{Finalize, Job, JobMeta, JobStore, JobStoreError, WebhookTestMeta};
use crate::queue::{QueueError, Task, TaskQueue};

use super::client::{DeliveryOutcome, OutboundRequest, WebhookSender};
use super::retry::RetryPolicy;
use super::signing::sign_payload;
use super::subscription::{LastDelivery, SubscriptionStore, SubscriptionStoreError, WebhookSubscription};

/// One queued delivery attempt. `delivery_id` is stable across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub delivery_id: Uuid,
    pub subscription_id: SubscriptionId,
    pub event: CatalogEvent,
    pub payload: DeliveryPayload,
    /// 1-based number of the attempt this task performs.
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl DeliveryTask {
    pub fn first(subscription_id: SubscriptionId, payload: DeliveryPayload) -> Self {
        Self {
            delivery_id: Uuid::now_v7(),
            subscription_id,
            event: payload.event,
            payload,
            attempt: 1,
            scheduled_at: Utc::now(),
        }
    }

    fn next_attempt(&self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            attempt: self.attempt + 1,
            scheduled_at,
            ..self.clone()
        }
    }
}

/// What happened to a delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered { status_code: u16 },
    /// Permanent failure, no retry.
    Rejected { status_code: Option<u16> },
    RetryScheduled { next_attempt: u32, delay_ms: u64 },
    /// Retryable failure on the last allowed attempt.
    Exhausted { attempts: u32, status_code: Option<u16> },
    /// The subscription is gone or disabled; nothing was sent.
    Skipped,
}

/// How many deliveries a batch of upserts produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitSummary {
    pub queued: usize,
    /// Deliveries that could not be queued. A row whose subscriptions could
    /// not be looked up counts once.
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Subscriptions(#[from] SubscriptionStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error("failed to serialise payload: {0}")]
    Payload(String),
}

/// Selects subscribers, signs and sends, and schedules retries.
#[derive(Clone)]
pub struct WebhookDispatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    queue: Arc<dyn TaskQueue>,
    sender: Arc<dyn WebhookSender>,
    jobs: Arc<dyn JobStore>,
    policy: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        queue: Arc<dyn TaskQueue>,
        sender: Arc<dyn WebhookSender>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            subscriptions,
            queue,
            sender,
            jobs,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Queue deliveries for a batch of upserts, looking subscriptions up once
    /// per event.
    ///
    /// Best effort: a failed lookup or enqueue is logged and counted, and the
    /// remaining rows still get their deliveries.
    pub async fn emit_upserts(&self, upserts: &[Upserted]) -> EmitSummary {
        let mut by_event: HashMap<CatalogEvent, Option<Vec<WebhookSubscription>>> = HashMap::new();
        let mut summary = EmitSummary::default();
        for upserted in upserts {
            let event = CatalogEvent::from(upserted.outcome);
            if !by_event.contains_key(&event) {
                let subs = match self.subscriptions.list_enabled(event).await {
                    Ok(subs) => Some(subs),
                    Err(e) => {
                        warn!(event = event.as_str(), error = %e, "failed to look up subscriptions");
                        None
                    }
                };
                by_event.insert(event, subs);
            }
            match by_event.get(&event) {
                Some(Some(subs)) => {
                    let (queued, failed) = self.enqueue_each(subs, event, &upserted.record).await;
                    summary.queued += queued;
                    summary.failed += failed;
                }
                _ => summary.failed += 1,
            }
        }
        summary
    }

    async fn enqueue_each(
        &self,
        subs: &[WebhookSubscription],
        event: CatalogEvent,
        record: &ProductRecord,
    ) -> (usize, usize) {
        if subs.is_empty() {
            return (0, 0);
        }
        let payload = match DeliveryPayload::product(event, record, Utc::now()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(sku = %record.sku, error = %e, "failed to build delivery payload");
                return (0, subs.len());
            }
        };
        let mut queued = 0;
        for sub in subs {
            let task = DeliveryTask::first(sub.id, payload.clone());
            let delivery_id = task.delivery_id;
            match self.queue.enqueue(Task::WebhookDelivery(task)).await {
                Ok(()) => {
                    debug!(subscription_id = %sub.id, %delivery_id, sku = %record.sku, "delivery queued");
                    queued += 1;
                }
                Err(e) => warn!(
                    subscription_id = %sub.id,
                    %delivery_id,
                    event = event.as_str(),
                    sku = %record.sku,
                    error = %e,
                    "failed to queue delivery"
                ),
            }
        }
        (queued, subs.len() - queued)
    }

    fn outbound(&self, sub: &WebhookSubscription, delivery_id: Uuid, payload: &DeliveryPayload) -> Result<OutboundRequest, DispatchError> {
        let body = payload.to_body().map_err(|e| DispatchError::Payload(e.to_string()))?;
        let signature = sub.secret.as_deref().map(|secret| sign_payload(secret, &body));
        Ok(OutboundRequest {
            url: sub.url.clone(),
            event: payload.event,
            delivery_id,
            body,
            signature,
        })
    }

    async fn record(&self, id: SubscriptionId, status_code: Option<u16>, latency_ms: u64) {
        let delivery = LastDelivery {
            status_code,
            latency_ms,
            at: Utc::now(),
        };
        if let Err(e) = self.subscriptions.record_last_delivery(id, delivery).await {
            warn!(subscription_id = %id, error = %e, "failed to record delivery result");
        }
    }

    /// Perform one attempt and decide what follows.
    #[instrument(
        skip(self, task),
        fields(
            delivery_id = %task.delivery_id,
            subscription_id = %task.subscription_id,
            attempt = task.attempt
        ),
        err
    )]
    pub async fn deliver(&self, task: DeliveryTask) -> Result<DeliveryReport, DispatchError> {
        let Some(sub) = self.subscriptions.get(task.subscription_id).await? else {
            warn!("subscription no longer exists, dropping delivery");
            return Ok(DeliveryReport::Skipped);
        };
        if !sub.enabled {
            debug!("subscription disabled, dropping delivery");
            return Ok(DeliveryReport::Skipped);
        }

        let request = self.outbound(&sub, task.delivery_id, &task.payload)?;
        let (outcome, status_code, latency_ms) = match self.sender.send(&request).await {
            Ok(response) => (response.outcome(), Some(response.status_code), response.latency_ms),
            Err(e) => {
                debug!(error = %e, "delivery attempt got no response");
                (e.outcome(), None, e.latency_ms())
            }
        };

        match outcome {
            DeliveryOutcome::Success => {
                self.record(sub.id, status_code, latency_ms).await;
                Ok(DeliveryReport::Delivered {
                    status_code: status_code.unwrap_or_default(),
                })
            }
            DeliveryOutcome::PermanentFailure => {
                warn!(url = %sub.url, status_code = ?status_code, "delivery rejected, not retrying");
                self.record(sub.id, status_code, latency_ms).await;
                Ok(DeliveryReport::Rejected { status_code })
            }
            DeliveryOutcome::RetryableFailure if self.policy.should_retry(task.attempt) => {
                let delay = self.policy.delay_after(task.attempt);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let scheduled_at =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let next = task.next_attempt(scheduled_at);
                let next_attempt = next.attempt;
                if let Err(e) = self.queue.enqueue_after(Task::WebhookDelivery(next), delay).await {
                    // Keep the attempt's result even though the retry is not queued.
                    self.record(sub.id, status_code, latency_ms).await;
                    return Err(e.into());
                }
                debug!(status_code = ?status_code, next_attempt, delay_ms, "delivery retry scheduled");
                Ok(DeliveryReport::RetryScheduled { next_attempt, delay_ms })
            }
            DeliveryOutcome::RetryableFailure => {
                error!(
                    url = %sub.url,
                    attempts = task.attempt,
                    last_status_code = ?status_code,
                    "webhook delivery exhausted its retries"
                );
                self.record(sub.id, status_code, latency_ms).await;
                Ok(DeliveryReport::Exhausted {
                    attempts: task.attempt,
                    status_code,
                })
            }
        }
    }

    /// Log a delivery that is being given up on after repeated handler
    /// errors. Whatever the last attempt returned is already recorded.
    pub fn abandon_delivery(&self, task: &DeliveryTask, reason: &str) {
        error!(
            delivery_id = %task.delivery_id,
            subscription_id = %task.subscription_id,
            event = task.event.as_str(),
            attempt = task.attempt,
            reason,
            "webhook delivery abandoned"
        );
    }

    /// Fail a `webhook_test` job that could not be run. `None` when the job
    /// could not be finalized (already finished, or the store is down).
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn abandon_test(&self, job_id: JobId, subscription_id: SubscriptionId, reason: &str) -> Option<Job> {
        let mut meta = WebhookTestMeta::new(subscription_id);
        meta.error = Some(reason.to_string());
        let fin = Finalize::failed(format!("Test delivery abandoned: {reason}")).with_meta(JobMeta::WebhookTest(meta));
        match self.jobs.finalize(job_id, fin).await {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "could not fail abandoned test job");
                None
            }
        }
    }

    /// Run a `webhook_test` job: one signed attempt at exactly one
    /// subscription, enabled or not.
    #[instrument(skip(self), fields(job_id = %job_id, subscription_id = %subscription_id), err)]
    pub async fn run_test(&self, job_id: JobId, subscription_id: SubscriptionId) -> Result<Job, DispatchError> {
        let Some(job) = self.jobs.get(job_id).await? else {
            return Err(JobStoreError::NotFound(job_id).into());
        };
        if job.status.is_terminal() {
            debug!("test job already finished, skipping redelivery");
            return Ok(job);
        }
        self.jobs.start(job_id).await?;

        let mut meta = WebhookTestMeta::new(subscription_id);
        let Some(sub) = self.subscriptions.get(subscription_id).await? else {
            let message = format!("Webhook subscription {subscription_id} not found");
            meta.error = Some(message.clone());
            let job = self
                .jobs
                .finalize(job_id, Finalize::failed(message).with_meta(JobMeta::WebhookTest(meta)))
                .await?;
            return Ok(job);
        };

        let payload = DeliveryPayload::test(sub.event, sub.id, Utc::now());
        let request = self.outbound(&sub, Uuid::now_v7(), &payload)?;

        let fin = match self.sender.send(&request).await {
            Ok(response) => {
                meta.status_code = Some(response.status_code);
                meta.latency_ms = Some(response.latency_ms);
                meta.outcome = Some(response.outcome());
                self.record(sub.id, Some(response.status_code), response.latency_ms).await;
                info!(status_code = response.status_code, latency_ms = response.latency_ms, "test delivery answered");
                Finalize::completed().with_message(format!(
                    "Test delivery returned HTTP {}",
                    response.status_code
                ))
            }
            Err(e) => {
                meta.latency_ms = Some(e.latency_ms());
                meta.outcome = Some(e.outcome());
                meta.error = Some(e.to_string());
                self.record(sub.id, None, e.latency_ms()).await;
                warn!(error = %e, "test delivery got no response");
                Finalize::failed(format!("Test delivery failed: {e}"))
            }
        };

        Ok(self
            .jobs
            .finalize(job_id, fin.with_meta(JobMeta::WebhookTest(meta)))
            .await?)
    }
}
