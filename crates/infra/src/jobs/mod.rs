//! Job tracking for asynchronous work.
//!
//! ## Design
//!
//! - Jobs are typed (`import`, `webhook_test`) with typed metadata
//! - Status moves `pending -> running -> {completed, failed}` and never leaves a terminal state
//! - `processed_rows` and `progress` are monotonic; `progress` hits 1.0 only on completion
//! - The worker that claimed a job is its only writer; everyone else reads snapshots
//!
//! ## Components
//!
//! - `Job`: lifecycle record, serialises to the progress payload
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `ProgressReader`: fetch, list and watch over the store

pub mod postgres;
pub mod reader;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use reader::ProgressReader;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    DEFAULT_SKIP_SAMPLE_LIMIT, Finalize, ImportMeta, Job, JobFilter, JobId, JobMeta, JobStatus,
    JobTransitionError, JobType, MAX_RUNNING_PROGRESS, ProgressUpdate, SkippedRow, WebhookTestMeta,
    running_progress,
};
