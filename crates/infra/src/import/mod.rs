//! CSV import worker.
//!
//! Turns a staged upload into catalog upserts and a terminal job:
//!
//! 1. claim the job (`pending`/`running` -> `running`), acking finished jobs
//! 2. check the header, then count data rows and persist `total_rows`
//! 3. parse on a blocking thread, one bounded chunk in flight at a time
//! 4. upsert each chunk in file order, queue change events, persist progress
//! 5. finalize and release the staged file, whatever happened
//!
//! Invalid rows are skipped and counted. Anything that stops the file from
//! being read or written fails the job.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use shelfsync_catalog::{HeaderError, UpsertOutcome};

use crate::catalog::{CatalogStore, CatalogStoreError};
use crate::jobs::{
    DEFAULT_SKIP_SAMPLE_LIMIT, Finalize, ImportMeta, Job, JobId, JobMeta, JobStore, JobStoreError,
    ProgressUpdate, running_progress,
};
use crate::staging::{StagedFile, StagingError, StagingStore};
use crate::webhooks::WebhookDispatcher;

pub mod reader;

pub use reader::{Chunk, ParsedRow, count_data_rows, stream_chunks};

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

pub const COMPLETE_MESSAGE: &str = "Import complete";

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("invalid CSV header: {0}")]
    Header(#[from] HeaderError),

    #[error("malformed CSV{}: {message}", line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    Malformed { line: Option<u64>, message: String },

    #[error("failed to read staged file: {0}")]
    Read(String),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Catalog(#[from] CatalogStoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error("import task failed: {0}")]
    Worker(String),
}

/// Running totals for one pass over the file.
#[derive(Debug, Default)]
struct ImportState {
    meta: ImportMeta,
    processed: u64,
}

#[derive(Clone)]
pub struct ImportWorker {
    jobs: Arc<dyn JobStore>,
    staging: Arc<dyn StagingStore>,
    catalog: Arc<dyn CatalogStore>,
    dispatcher: Option<WebhookDispatcher>,
    chunk_size: usize,
    skip_sample_limit: usize,
}

impl ImportWorker {
    pub fn new(jobs: Arc<dyn JobStore>, staging: Arc<dyn StagingStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            jobs,
            staging,
            catalog,
            dispatcher: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_sample_limit: DEFAULT_SKIP_SAMPLE_LIMIT,
        }
    }

    /// Queue `product.created`/`product.updated` deliveries for every upsert.
    pub fn with_dispatcher(mut self, dispatcher: WebhookDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_skip_sample_limit(mut self, limit: usize) -> Self {
        self.skip_sample_limit = limit;
        self
    }

    /// Process one import task to a terminal job.
    ///
    /// Returns the final job. An `Err` means the job store itself could not
    /// be reached; the job may then still be non-terminal.
    #[instrument(skip(self, staged), fields(job_id = %job_id, size_bytes = staged.size_bytes), err)]
    pub async fn process(&self, job_id: JobId, staged: &StagedFile) -> Result<Job, ImportError> {
        let Some(job) = self.jobs.get(job_id).await? else {
            self.release(staged).await;
            return Err(JobStoreError::NotFound(job_id).into());
        };
        if job.status.is_terminal() {
            debug!(status = job.status.as_str(), "import already finished, skipping redelivery");
            self.release(staged).await;
            return Ok(job);
        }

        if let Err(e) = self.jobs.start(job_id).await {
            error!(error = %e, "failed to claim import job");
            let failed = self
                .jobs
                .finalize(
                    job_id,
                    Finalize::failed(format!("Failed to start import: {e}")).with_message("Import failed"),
                )
                .await;
            self.release(staged).await;
            return failed.map_err(|_| ImportError::from(e));
        }
        info!("import started");

        let mut state = ImportState::default();
        let fin = match self.run(job_id, staged, &mut state).await {
            Ok(()) => {
                info!(
                    processed_rows = state.processed,
                    inserted = state.meta.inserted,
                    updated = state.meta.updated,
                    skipped = state.meta.skipped,
                    "import complete"
                );
                Finalize::completed()
                    .with_message(COMPLETE_MESSAGE)
                    .with_processed_rows(state.processed)
                    .with_meta(JobMeta::Import(state.meta))
            }
            Err(e) => {
                error!(error = %e, processed_rows = state.processed, "import failed");
                Finalize::failed(e.to_string())
                    .with_message("Import failed")
                    .with_meta(JobMeta::Import(state.meta))
            }
        };

        let finished = self.jobs.finalize(job_id, fin).await;
        self.release(staged).await;
        Ok(finished?)
    }

    /// Give up on an import task that keeps erroring: fail the job if it is
    /// still open and drop the staged file. Returns the job when it could be
    /// finalized.
    #[instrument(skip(self, staged), fields(job_id = %job_id))]
    pub async fn abandon(&self, job_id: JobId, staged: &StagedFile, reason: &str) -> Option<Job> {
        let fin = Finalize::failed(format!("Import abandoned: {reason}")).with_message("Import failed");
        let job = match self.jobs.finalize(job_id, fin).await {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "could not fail abandoned import job");
                None
            }
        };
        self.release(staged).await;
        job
    }

    async fn release(&self, staged: &StagedFile) {
        match self.staging.release(staged).await {
            Ok(true) => debug!(key = %staged.key, "staged file released"),
            Ok(false) => {}
            Err(e) => warn!(key = %staged.key, error = %e, "failed to release staged file"),
        }
    }

    async fn run(&self, job_id: JobId, staged: &StagedFile, state: &mut ImportState) -> Result<(), ImportError> {
        let counting = self.staging.open(staged).await?;
        let total = tokio::task::spawn_blocking(move || count_data_rows(counting))
            .await
            .map_err(|e| ImportError::Worker(e.to_string()))??;

        self.jobs
            .update_progress(
                job_id,
                ProgressUpdate::new(0, Some(total)).with_message(format!("Processed 0/{total} rows")),
            )
            .await?;

        let parsing = self.staging.open(staged).await?;
        let (tx, mut rx) = mpsc::channel(1);
        let chunk_size = self.chunk_size;
        let parser = tokio::task::spawn_blocking(move || stream_chunks(parsing, chunk_size, tx));

        while let Some(chunk) = rx.recv().await {
            self.apply_chunk(job_id, chunk?, total, state).await?;
        }

        parser.await.map_err(|e| ImportError::Worker(e.to_string()))?;
        Ok(())
    }

    async fn apply_chunk(
        &self,
        job_id: JobId,
        chunk: Chunk,
        total: u64,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let mut rows = Vec::with_capacity(chunk.rows.len());
        for parsed in chunk.rows {
            match parsed {
                ParsedRow::Valid(row) => rows.push(row),
                ParsedRow::Skipped(sample) => {
                    debug!(line = sample.line, reason = %sample.reason, "row skipped");
                    state.meta.record_skip(sample, self.skip_sample_limit);
                }
            }
        }

        if !rows.is_empty() {
            let upserts = self.catalog.upsert_batch(rows).await?;
            for upserted in &upserts {
                match upserted.outcome {
                    UpsertOutcome::Created => state.meta.inserted += 1,
                    UpsertOutcome::Updated => state.meta.updated += 1,
                }
            }
            state.processed += upserts.len() as u64;

            if let Some(dispatcher) = &self.dispatcher {
                let emitted = dispatcher.emit_upserts(&upserts).await;
                if emitted.failed > 0 {
                    warn!(
                        queued = emitted.queued,
                        failed = emitted.failed,
                        rows = upserts.len(),
                        "some change events could not be queued"
                    );
                }
            }
        }

        let seen = chunk.rows_seen;
        self.jobs
            .update_progress(
                job_id,
                ProgressUpdate::new(state.processed, Some(total))
                    .with_progress(running_progress(seen, total))
                    .with_message(format!("Processed {seen}/{total} rows"))
                    .with_meta(JobMeta::Import(state.meta.clone())),
            )
            .await?;
        debug!(rows_seen = seen, total_rows = total, "chunk applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use shelfsync_catalog::{ProductFields, ProductRecord, ProductRow, Sku};
    use shelfsync_events::CatalogEvent;

    use crate::catalog::{InMemoryCatalogStore, Upserted};
    use crate::jobs::{InMemoryJobStore, JobFilter, JobStatus};
    use crate::queue::{InMemoryTaskQueue, Lane};
    use crate::staging::InMemoryStagingStore;
    use crate::webhooks::{HttpWebhookSender, InMemorySubscriptionStore, WebhookSubscription};

    /// Delegates to the in-memory catalog but fails batch number `fail_on`.
    struct FlakyCatalog {
        inner: InMemoryCatalogStore,
        fail_on: usize,
        batches: AtomicUsize,
    }

    impl FlakyCatalog {
        fn failing_batch(fail_on: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryCatalogStore::new(),
                fail_on,
                batches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CatalogStore for FlakyCatalog {
        async fn upsert_by_sku(&self, sku: &Sku, fields: ProductFields) -> Result<Upserted, CatalogStoreError> {
            self.inner.upsert_by_sku(sku, fields).await
        }

        async fn upsert_batch(&self, rows: Vec<ProductRow>) -> Result<Vec<Upserted>, CatalogStoreError> {
            if self.batches.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(CatalogStoreError::Unavailable("connection reset".into()));
            }
            self.inner.upsert_batch(rows).await
        }

        async fn get_by_sku(&self, sku: &str) -> Result<Option<ProductRecord>, CatalogStoreError> {
            self.inner.get_by_sku(sku).await
        }
    }

    /// Job store whose `start` is always refused.
    struct UnstartableJobs(Arc<InMemoryJobStore>);

    #[async_trait]
    impl JobStore for UnstartableJobs {
        async fn create_job(&self, job: Job) -> Result<Job, JobStoreError> {
            self.0.create_job(job).await
        }

        async fn start(&self, _job_id: JobId) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Storage("deadlock detected".into()))
        }

        async fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<Job, JobStoreError> {
            self.0.update_progress(job_id, update).await
        }

        async fn finalize(&self, job_id: JobId, fin: Finalize) -> Result<Job, JobStoreError> {
            self.0.finalize(job_id, fin).await
        }

        async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.0.get(job_id).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
            self.0.list(filter).await
        }
    }

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        staging: Arc<InMemoryStagingStore>,
        catalog: Arc<InMemoryCatalogStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                jobs: InMemoryJobStore::arc(),
                staging: Arc::new(InMemoryStagingStore::new()),
                catalog: Arc::new(InMemoryCatalogStore::new()),
            }
        }

        fn worker(&self) -> ImportWorker {
            ImportWorker::new(self.jobs.clone(), self.staging.clone(), self.catalog.clone()).with_chunk_size(2)
        }

        async fn import(&self, csv: &[u8]) -> (Job, StagedFile) {
            let job = self.jobs.create_job(Job::import()).await.unwrap();
            let staged = self.staging.stage(job.id, csv).await.unwrap();
            let done = self.worker().process(job.id, &staged).await.unwrap();
            (done, staged)
        }
    }

    #[tokio::test]
    async fn duplicate_sku_last_wins_and_missing_sku_is_skipped() {
        let fx = Fixture::new();
        let (job, staged) = fx
            .import(b"sku,name,description\nA1,Widget,desc\nA1,Widget v2,desc2\n,NoSku,desc3\n")
            .await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_rows, 2);
        assert_eq!(job.total_rows, Some(3));
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.message.as_deref(), Some(COMPLETE_MESSAGE));

        let meta = job.import_meta().unwrap();
        assert_eq!((meta.inserted, meta.updated, meta.skipped), (1, 1, 1));
        assert_eq!(meta.skip_samples[0].line, 4);

        assert_eq!(fx.catalog.len(), 1);
        let a1 = fx.catalog.get_by_sku("A1").await.unwrap().unwrap();
        assert_eq!(a1.name, "Widget v2");
        assert_eq!(a1.description.as_deref(), Some("desc2"));
        assert!(!fx.staging.contains(&staged));
    }

    #[tokio::test]
    async fn missing_header_fails_without_progress() {
        let fx = Fixture::new();
        let (job, staged) = fx.import(b"sku,title\nA1,Widget\n").await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_rows, 0);
        assert_eq!(job.total_rows, None);
        assert_eq!(job.progress, 0.0);
        assert!(job.error_message.as_deref().unwrap().contains("name"));
        assert!(fx.catalog.is_empty());
        assert!(!fx.staging.contains(&staged));
    }

    #[tokio::test]
    async fn missing_staged_file_fails_the_job() {
        let fx = Fixture::new();
        let job = fx.jobs.create_job(Job::import()).await.unwrap();
        let staged = fx.staging.stage(job.id, b"sku,name\n").await.unwrap();
        fx.staging.release(&staged).await.unwrap();

        let done = fx.worker().process(job.id, &staged).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error_message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn valid_and_invalid_rows_are_counted() {
        let fx = Fixture::new();
        let (job, _) = fx
            .import(b"sku,name,active\nA,1,yes\nB,,\nC,3,maybe\nD,4,0\nE,5,\n")
            .await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_rows, 3);
        let meta = job.import_meta().unwrap();
        assert_eq!(meta.skipped, 2);
        assert!(!fx.catalog.get_by_sku("d").await.unwrap().unwrap().active);
        assert!(fx.catalog.get_by_sku("e").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn reprocessing_is_idempotent() {
        let fx = Fixture::new();
        let csv = b"sku,name\nA1,Widget\nB2,Gadget\n";
        fx.import(csv).await;
        let first = fx.catalog.snapshot();

        let (second_job, _) = fx.import(csv).await;
        let second = fx.catalog.snapshot();

        assert_eq!(second_job.import_meta().unwrap().updated, 2);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!((a.id, &a.sku, &a.name), (b.id, &b.sku, &b.name));
        }
    }

    #[tokio::test]
    async fn finished_job_is_acked_without_work() {
        let fx = Fixture::new();
        let (job, staged) = fx.import(b"sku,name\nA1,Widget\n").await;

        let again = fx.worker().process(job.id, &staged).await.unwrap();
        assert_eq!(again, job);
    }

    #[tokio::test]
    async fn header_only_file_completes_empty() {
        let fx = Fixture::new();
        let (job, _) = fx.import(b"sku,name\n").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_rows, Some(0));
        assert_eq!(job.processed_rows, 0);
    }

    #[tokio::test]
    async fn catalog_failure_mid_file_fails_with_partial_progress() {
        let fx = Fixture::new();
        let catalog = FlakyCatalog::failing_batch(2);
        let worker = ImportWorker::new(fx.jobs.clone(), fx.staging.clone(), catalog.clone()).with_chunk_size(2);
        let job = fx.jobs.create_job(Job::import()).await.unwrap();
        let staged = fx
            .staging
            .stage(job.id, b"sku,name\nA,1\nB,2\nC,3\nD,4\n")
            .await
            .unwrap();

        let done = worker.process(job.id, &staged).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.total_rows, Some(4));
        assert_eq!(done.processed_rows, 2);
        assert_eq!(done.progress, 0.5);
        assert_eq!(done.message.as_deref(), Some("Import failed"));
        assert!(done.error_message.as_deref().unwrap().contains("connection reset"));
        assert!(catalog.get_by_sku("B").await.unwrap().is_some());
        assert!(catalog.get_by_sku("C").await.unwrap().is_none());
        assert!(!fx.staging.contains(&staged));
    }

    #[tokio::test]
    async fn event_queue_outage_does_not_fail_the_import() {
        let fx = Fixture::new();
        let subs = Arc::new(InMemorySubscriptionStore::new());
        subs.insert(WebhookSubscription::new("http://hook", CatalogEvent::ProductCreated));
        let queue = InMemoryTaskQueue::arc();
        queue.close();
        let sender = Arc::new(HttpWebhookSender::new(Duration::from_secs(1)).unwrap());
        let dispatcher = WebhookDispatcher::new(subs, queue.clone(), sender, fx.jobs.clone());
        let worker = fx.worker().with_dispatcher(dispatcher);

        let job = fx.jobs.create_job(Job::import()).await.unwrap();
        let staged = fx.staging.stage(job.id, b"sku,name\nA1,Widget\nB2,Gadget\n").await.unwrap();
        let done = worker.process(job.id, &staged).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_rows, 2);
        assert_eq!(done.import_meta().unwrap().inserted, 2);
        assert_eq!(fx.catalog.len(), 2);
        assert_eq!(queue.ready(Lane::Webhooks), 0);
        assert!(!fx.staging.contains(&staged));
    }

    #[tokio::test]
    async fn refused_start_fails_the_job_and_releases_the_file() {
        let fx = Fixture::new();
        let jobs = Arc::new(UnstartableJobs(fx.jobs.clone()));
        let worker = ImportWorker::new(jobs, fx.staging.clone(), fx.catalog.clone());
        let job = fx.jobs.create_job(Job::import()).await.unwrap();
        let staged = fx.staging.stage(job.id, b"sku,name\nA1,Widget\n").await.unwrap();

        let done = worker.process(job.id, &staged).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error_message.as_deref().unwrap().contains("deadlock detected"));
        assert!(fx.catalog.is_empty());
        assert!(!fx.staging.contains(&staged));
    }

    #[tokio::test]
    async fn abandon_fails_open_job_and_releases_the_file() {
        let fx = Fixture::new();
        let job = fx.jobs.create_job(Job::import()).await.unwrap();
        let staged = fx.staging.stage(job.id, b"sku,name\nA1,Widget\n").await.unwrap();

        let failed = fx.worker().abandon(job.id, &staged, "queue unavailable").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.as_deref().unwrap().contains("queue unavailable"));
        assert!(!fx.staging.contains(&staged));

        assert!(fx.worker().abandon(job.id, &staged, "again").await.is_none());
    }
}
