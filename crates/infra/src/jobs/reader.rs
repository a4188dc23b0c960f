//! Read-only view over the job store for pollers and push subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobFilter, JobId};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_IDLE_POLLS: u32 = 300;

/// Snapshot reader. Never writes and never computes on job data.
#[derive(Clone)]
pub struct ProgressReader {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
    idle_polls: u32,
}

impl ProgressReader {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_polls: DEFAULT_IDLE_POLLS,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Stop a watch after this many consecutive polls without a change.
    pub fn with_idle_polls(mut self, polls: u32) -> Self {
        self.idle_polls = polls.max(1);
        self
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        self.store.list(filter).await
    }

    /// Stream of snapshots, one per observed change.
    ///
    /// The first item is the current snapshot. The stream ends after a
    /// terminal snapshot, after `idle_polls` unchanged polls, or when the
    /// consumer goes away. An unknown job yields a single `NotFound`.
    pub fn watch(&self, job_id: JobId) -> UnboundedReceiverStream<Result<Job, JobStoreError>> {
        let (tx, rx) = unbounded_channel();
        let store = self.store.clone();
        let poll_interval = self.poll_interval;
        let idle_limit = self.idle_polls;

        tokio::spawn(async move {
            let mut last: Option<Job> = None;
            let mut idle = 0u32;

            loop {
                match store.get(job_id).await {
                    Ok(Some(job)) => {
                        let terminal = job.status.is_terminal();
                        if last.as_ref() != Some(&job) {
                            idle = 0;
                            last = Some(job.clone());
                            if tx.send(Ok(job)).is_err() {
                                break;
                            }
                        } else {
                            idle += 1;
                        }
                        if terminal {
                            break;
                        }
                        if idle >= idle_limit {
                            debug!(job_id = %job_id, idle_polls = idle, "job watch idle, closing");
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Err(JobStoreError::NotFound(job_id)));
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }

                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        UnboundedReceiverStream::new(rx)
    }
}
