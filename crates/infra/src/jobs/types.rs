//! Core job types: lifecycle, typed metadata, progress updates.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shelfsync_core::SubscriptionId;
pub use shelfsync_core::JobId;

use crate::webhooks::DeliveryOutcome;

/// Highest progress a job can report before it is completed.
pub const MAX_RUNNING_PROGRESS: f64 = 0.99;

/// Default cap on the number of skipped-row samples kept in import metadata.
pub const DEFAULT_SKIP_SAMPLE_LIMIT: usize = 20;

/// Kind of asynchronous work a job tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Import,
    WebhookTest,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Import => "import",
            JobType::WebhookTest => "webhook_test",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(JobType::Import),
            "webhook_test" => Ok(JobType::WebhookTest),
            other => Err(format!("unknown job type {other:?}")),
        }
    }
}

/// Job lifecycle status.
///
/// `pending -> running -> {completed, failed}`. A pending job that could not
/// be started may go straight to `failed`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `running -> running` is a broker redelivery re-claim.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Running) | (Running, Completed) | (Running, Failed) | (Pending, Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// A row the importer skipped, kept as a sample for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    /// 1-based line in the file (the header is line 1).
    pub line: u64,
    pub sku: Option<String>,
    pub reason: String,
}

/// Counters and samples for an import job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMeta {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub skip_samples: Vec<SkippedRow>,
}

impl ImportMeta {
    pub fn record_skip(&mut self, sample: SkippedRow, sample_limit: usize) {
        self.skipped += 1;
        if self.skip_samples.len() < sample_limit {
            self.skip_samples.push(sample);
        }
    }
}

/// Result of a webhook test delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTestMeta {
    pub subscription_id: SubscriptionId,
    pub status_code: Option<u16>,
    pub latency_ms: Option<u64>,
    pub outcome: Option<DeliveryOutcome>,
    pub error: Option<String>,
}

impl WebhookTestMeta {
    pub fn new(subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            status_code: None,
            latency_ms: None,
            outcome: None,
            error: None,
        }
    }
}

/// Job-type-specific detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobMeta {
    Import(ImportMeta),
    WebhookTest(WebhookTestMeta),
}

impl JobMeta {
    pub fn job_type(&self) -> JobType {
        match self {
            JobMeta::Import(_) => JobType::Import,
            JobMeta::WebhookTest(_) => JobType::WebhookTest,
        }
    }
}

/// Illegal job mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobTransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: JobStatus, to: JobStatus },

    #[error("progress can only be recorded while running (status: {0})")]
    NotRunning(JobStatus),

    #[error("finalize requires a terminal status, got {0}")]
    NotTerminal(JobStatus),

    #[error("metadata for {meta:?} does not fit a {job:?} job")]
    MetaMismatch { job: JobType, meta: JobType },
}

/// Progress written at a chunk boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub processed_rows: u64,
    pub total_rows: Option<u64>,
    pub progress: f64,
    pub message: Option<String>,
    pub meta: Option<JobMeta>,
}

impl ProgressUpdate {
    pub fn new(processed_rows: u64, total_rows: Option<u64>) -> Self {
        Self {
            processed_rows,
            total_rows,
            progress: 0.0,
            message: None,
            meta: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_meta(mut self, meta: JobMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Terminal write for a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalize {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub message: Option<String>,
    pub processed_rows: Option<u64>,
    pub meta: Option<JobMeta>,
}

impl Finalize {
    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            error_message: None,
            message: None,
            processed_rows: None,
            meta: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(error.into()),
            ..Self::completed()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_processed_rows(mut self, processed_rows: u64) -> Self {
        self.processed_rows = Some(processed_rows);
        self
    }

    pub fn with_meta(mut self, meta: JobMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Running progress for `seen` of `total` rows, capped below completion.
pub fn running_progress(seen: u64, total: u64) -> f64 {
    let denominator = seen.max(total);
    if denominator == 0 {
        return 0.0;
    }
    (seen as f64 / denominator as f64).clamp(0.0, MAX_RUNNING_PROGRESS)
}

/// A tracked unit of asynchronous work.
///
/// Serialises to the progress payload surfaced to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: f64,
    pub message: Option<String>,
    pub total_rows: Option<u64>,
    pub processed_rows: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub meta: JobMeta,
}

impl Job {
    fn with_meta(meta: JobMeta) -> Self {
        Self {
            id: JobId::new(),
            job_type: meta.job_type(),
            status: JobStatus::Pending,
            progress: 0.0,
            message: Some("Queued".to_string()),
            total_rows: None,
            processed_rows: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            meta,
        }
    }

    pub fn import() -> Self {
        Self::with_meta(JobMeta::Import(ImportMeta::default()))
    }

    pub fn webhook_test(subscription_id: SubscriptionId) -> Self {
        Self::with_meta(JobMeta::WebhookTest(WebhookTestMeta::new(subscription_id)))
    }

    /// Use an id allocated earlier (staging keys files by job id).
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), JobTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(JobTransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    fn replace_meta(&mut self, meta: JobMeta) -> Result<(), JobTransitionError> {
        if meta.job_type() != self.job_type {
            return Err(JobTransitionError::MetaMismatch {
                job: self.job_type,
                meta: meta.job_type(),
            });
        }
        self.meta = meta;
        Ok(())
    }

    /// Claim the job. Re-claiming a running job keeps its first `started_at`.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Apply a progress update. Counters and progress never move backwards.
    pub fn record_progress(&mut self, update: ProgressUpdate) -> Result<(), JobTransitionError> {
        if self.status != JobStatus::Running {
            return Err(JobTransitionError::NotRunning(self.status));
        }
        if let Some(meta) = update.meta {
            self.replace_meta(meta)?;
        }
        self.processed_rows = self.processed_rows.max(update.processed_rows);
        if update.total_rows.is_some() {
            self.total_rows = update.total_rows;
        }
        let progress = update.progress.clamp(0.0, MAX_RUNNING_PROGRESS);
        self.progress = self.progress.max(progress);
        if update.message.is_some() {
            self.message = update.message;
        }
        Ok(())
    }

    pub fn finalize(&mut self, fin: Finalize, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        if !fin.status.is_terminal() {
            return Err(JobTransitionError::NotTerminal(fin.status));
        }
        if let Some(meta) = &fin.meta {
            if meta.job_type() != self.job_type {
                return Err(JobTransitionError::MetaMismatch {
                    job: self.job_type,
                    meta: meta.job_type(),
                });
            }
        }
        self.transition(fin.status)?;

        if let Some(meta) = fin.meta {
            self.meta = meta;
        }
        if let Some(processed) = fin.processed_rows {
            self.processed_rows = self.processed_rows.max(processed);
        }
        if fin.status == JobStatus::Completed {
            self.progress = 1.0;
            self.error_message = None;
        } else {
            self.error_message = fin.error_message;
        }
        if fin.message.is_some() {
            self.message = fin.message;
        }
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn import_meta(&self) -> Option<&ImportMeta> {
        match &self.meta {
            JobMeta::Import(meta) => Some(meta),
            JobMeta::WebhookTest(_) => None,
        }
    }

    pub fn webhook_test_meta(&self) -> Option<&WebhookTestMeta> {
        match &self.meta {
            JobMeta::WebhookTest(meta) => Some(meta),
            JobMeta::Import(_) => None,
        }
    }
}

/// Filter for listing jobs. Newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub since: Option<DateTime<Utc>>,
    limit: usize,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    pub fn new() -> Self {
        Self {
            status: None,
            job_type: None,
            since: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Clamped to `1..=MAX_LIMIT`.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, Self::MAX_LIMIT);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.job_type.is_none_or(|t| t == job.job_type)
            && self.since.is_none_or(|since| job.created_at >= since)
    }
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_import() -> Job {
        let mut job = Job::import();
        job.mark_running(Utc::now()).unwrap();
        job
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn reclaim_keeps_first_started_at() {
        let mut job = running_import();
        let first = job.started_at;
        job.mark_running(Utc::now() + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(job.started_at, first);
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut job = running_import();
        job.record_progress(ProgressUpdate::new(10, Some(20)).with_progress(0.5))
            .unwrap();
        job.record_progress(ProgressUpdate::new(4, Some(20)).with_progress(0.2))
            .unwrap();

        assert_eq!(job.processed_rows, 10);
        assert_eq!(job.progress, 0.5);
        assert_eq!(job.total_rows, Some(20));
    }

    #[test]
    fn running_progress_is_capped_below_one() {
        let mut job = running_import();
        job.record_progress(ProgressUpdate::new(20, Some(20)).with_progress(1.0))
            .unwrap();
        assert_eq!(job.progress, MAX_RUNNING_PROGRESS);

        job.finalize(Finalize::completed(), Utc::now()).unwrap();
        assert_eq!(job.progress, 1.0);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn progress_requires_running() {
        let mut job = Job::import();
        let err = job.record_progress(ProgressUpdate::new(1, None)).unwrap_err();
        assert_eq!(err, JobTransitionError::NotRunning(JobStatus::Pending));
    }

    #[test]
    fn failed_keeps_progress_and_records_error() {
        let mut job = running_import();
        job.record_progress(ProgressUpdate::new(5, Some(10)).with_progress(0.5))
            .unwrap();
        job.finalize(Finalize::failed("disk gone"), Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 0.5);
        assert_eq!(job.error_message.as_deref(), Some("disk gone"));
    }

    #[test]
    fn terminal_jobs_reject_further_changes() {
        let mut job = running_import();
        job.finalize(Finalize::completed(), Utc::now()).unwrap();

        assert!(job.mark_running(Utc::now()).is_err());
        assert!(job.finalize(Finalize::failed("late"), Utc::now()).is_err());
        assert!(job.record_progress(ProgressUpdate::new(1, None)).is_err());
    }

    #[test]
    fn meta_must_match_job_type() {
        let mut job = running_import();
        let meta = JobMeta::WebhookTest(WebhookTestMeta::new(SubscriptionId::new()));
        let err = job.record_progress(ProgressUpdate::new(0, None).with_meta(meta)).unwrap_err();
        assert!(matches!(err, JobTransitionError::MetaMismatch { .. }));
    }

    #[test]
    fn skip_samples_are_bounded() {
        let mut meta = ImportMeta::default();
        for line in 0..5 {
            meta.record_skip(
                SkippedRow {
                    line,
                    sku: None,
                    reason: "missing sku".into(),
                },
                2,
            );
        }
        assert_eq!(meta.skipped, 5);
        assert_eq!(meta.skip_samples.len(), 2);
    }

    #[test]
    fn running_progress_handles_unknown_and_overflowing_totals() {
        assert_eq!(running_progress(0, 0), 0.0);
        assert_eq!(running_progress(5, 10), 0.5);
        assert_eq!(running_progress(12, 10), MAX_RUNNING_PROGRESS);
    }

    #[test]
    fn job_serializes_as_progress_payload() {
        let job = Job::import();
        let json = serde_json::to_value(&job).unwrap();
        for key in [
            "id",
            "status",
            "progress",
            "message",
            "total_rows",
            "processed_rows",
            "error_message",
            "started_at",
            "finished_at",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["type"], "import");
        assert_eq!(json["meta"]["type"], "import");
    }

    #[test]
    fn filter_limit_is_clamped() {
        assert_eq!(JobFilter::new().limit(), 50);
        assert_eq!(JobFilter::new().with_limit(10_000).limit(), 500);
        assert_eq!(JobFilter::new().with_limit(0).limit(), 1);
    }
}
