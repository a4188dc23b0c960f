//! Request-time side of the pipeline: create the job, park the input, enqueue.
//!
//! Nothing here does the work itself. Errors surface synchronously to the
//! caller, and a job whose task could not be queued is failed on the spot
//! so it never sits in `pending` forever.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use shelfsync_core::SubscriptionId;

use crate::jobs::{Finalize, Job, JobId, JobStore, JobStoreError};
use crate::queue::{QueueError, Task, TaskQueue};
use crate::staging::{StagedFile, StagingError, StagingStore};
use crate::webhooks::{SubscriptionStore, SubscriptionStoreError};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("webhook subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Subscriptions(#[from] SubscriptionStoreError),
}

#[derive(Clone)]
pub struct Intake {
    jobs: Arc<dyn JobStore>,
    staging: Arc<dyn StagingStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    queue: Arc<dyn TaskQueue>,
    max_upload_bytes: u64,
}

impl Intake {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        staging: Arc<dyn StagingStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            jobs,
            staging,
            subscriptions,
            queue,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, limit: u64) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Create an import job for an already staged file and queue it.
    #[instrument(skip(self, staged), fields(job_id = %staged.job_id, size_bytes = staged.size_bytes), err)]
    pub async fn enqueue_import(&self, staged: StagedFile) -> Result<JobId, IntakeError> {
        let job = match self.jobs.create_job(Job::import().with_id(staged.job_id)).await {
            Ok(job) => job,
            Err(e) => {
                self.release(&staged).await;
                return Err(e.into());
            }
        };

        let task = Task::Import {
            job_id: job.id,
            staged: staged.clone(),
        };
        if let Err(e) = self.queue.enqueue(task).await {
            self.fail_unqueued(job.id, &e).await;
            self.release(&staged).await;
            return Err(e.into());
        }

        info!("import queued");
        Ok(job.id)
    }

    /// Validate an upload, stage it and queue its import.
    #[instrument(skip(self, bytes), fields(filename = %filename, size_bytes = bytes.len()), err)]
    pub async fn stage_and_enqueue_import(&self, filename: &str, bytes: &[u8]) -> Result<JobId, IntakeError> {
        let is_csv = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if !is_csv {
            return Err(IntakeError::InvalidUpload("only .csv files are accepted".to_string()));
        }
        if bytes.is_empty() {
            return Err(IntakeError::InvalidUpload("uploaded file is empty".to_string()));
        }
        let size = bytes.len() as u64;
        if size > self.max_upload_bytes {
            return Err(IntakeError::TooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }

        let staged = self.staging.stage(JobId::new(), bytes).await?;
        self.enqueue_import(staged).await
    }

    /// Queue a diagnostic delivery to one subscription.
    #[instrument(skip(self), fields(subscription_id = %subscription_id), err)]
    pub async fn enqueue_webhook_test(&self, subscription_id: SubscriptionId) -> Result<JobId, IntakeError> {
        if self.subscriptions.get(subscription_id).await?.is_none() {
            return Err(IntakeError::SubscriptionNotFound(subscription_id));
        }

        let job = self.jobs.create_job(Job::webhook_test(subscription_id)).await?;
        let task = Task::WebhookTest {
            job_id: job.id,
            subscription_id,
        };
        if let Err(e) = self.queue.enqueue(task).await {
            self.fail_unqueued(job.id, &e).await;
            return Err(e.into());
        }

        info!(job_id = %job.id, "webhook test queued");
        Ok(job.id)
    }

    async fn fail_unqueued(&self, job_id: JobId, cause: &QueueError) {
        error!(job_id = %job_id, error = %cause, "failed to enqueue job");
        let fin = Finalize::failed(format!("Failed to enqueue job: {cause}"));
        if let Err(e) = self.jobs.finalize(job_id, fin).await {
            warn!(job_id = %job_id, error = %e, "failed to mark unqueued job as failed");
        }
    }

    async fn release(&self, staged: &StagedFile) {
        if let Err(e) = self.staging.release(staged).await {
            warn!(key = %staged.key, error = %e, "failed to release staged file");
        }
    }
}
