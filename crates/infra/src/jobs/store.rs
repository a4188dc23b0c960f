//! Job storage: the trait and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::types::{Finalize, Job, JobFilter, JobId, JobTransitionError, ProgressUpdate};

/// Job store abstraction.
///
/// Single source of truth for job state. Only the worker that claimed a job
/// writes to it; every other component reads snapshots.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly built pending job.
    async fn create_job(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Claim a job for processing (`pending|running -> running`).
    async fn start(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Record chunk-boundary progress on a running job.
    async fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<Job, JobStoreError>;

    /// Move a job to `completed` or `failed`.
    async fn finalize(&self, job_id: JobId, fin: Finalize) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("job {job_id}: {source}")]
    InvalidTransition {
        job_id: JobId,
        #[source]
        source: JobTransitionError,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn mutate(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job) -> Result<(), JobTransitionError>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        // Work on a copy so a rejected change leaves the stored job untouched.
        let mut next = job.clone();
        f(&mut next).map_err(|source| JobStoreError::InvalidTransition { job_id, source })?;
        *job = next.clone();
        Ok(next)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn start(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.mutate(job_id, |job| job.mark_running(Utc::now()))
    }

    async fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<Job, JobStoreError> {
        self.mutate(job_id, |job| job.record_progress(update))
    }

    async fn finalize(&self, job_id: JobId, fin: Finalize) -> Result<Job, JobStoreError> {
        self.mutate(job_id, |job| job.finalize(fin, Utc::now()))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut matching: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        matching.truncate(filter.limit());
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobStatus, JobType};
    use shelfsync_core::SubscriptionId;

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(Job::import()).await.unwrap();

        let running = store.start(job.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        store
            .update_progress(job.id, ProgressUpdate::new(3, Some(6)).with_progress(0.5))
            .await
            .unwrap();

        let done = store
            .finalize(job.id, Finalize::completed().with_processed_rows(6))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_rows, 6);
        assert_eq!(done.progress, 1.0);

        let read = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(read, done);
    }

    #[tokio::test]
    async fn rejected_transition_leaves_job_unchanged() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(Job::import()).await.unwrap();

        let err = store.finalize(job.id, Finalize::completed()).await.unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_ids_are_errors() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(Job::import()).await.unwrap();

        assert!(matches!(
            store.create_job(job.clone()).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
        assert!(matches!(store.start(JobId::new()).await, Err(JobStoreError::NotFound(_))));
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let store = InMemoryJobStore::new();
        let first = store.create_job(Job::import()).await.unwrap();
        let second = store.create_job(Job::import()).await.unwrap();
        let test = store
            .create_job(Job::webhook_test(SubscriptionId::new()))
            .await
            .unwrap();
        store.start(second.id).await.unwrap();

        let all = store.list(&JobFilter::new()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![test.id, second.id, first.id]);

        let imports = store
            .list(&JobFilter::new().with_type(JobType::Import))
            .await
            .unwrap();
        assert_eq!(imports.len(), 2);

        let running = store
            .list(&JobFilter::new().with_status(JobStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, second.id);

        let limited = store.list(&JobFilter::new().with_limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
