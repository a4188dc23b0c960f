use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shelfsync_core::JobId;
use shelfsync_infra::jobs::{JobFilter, JobStatus, JobType};

use crate::app::errors;

/// `202 Accepted` body for anything that creates a job.
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobListQuery {
    pub fn into_filter(self) -> Result<JobFilter, axum::response::Response> {
        let invalid = |msg: String| errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_filter", msg);

        let mut filter = JobFilter::new();
        if let Some(raw) = self.status {
            filter = filter.with_status(raw.parse::<JobStatus>().map_err(invalid)?);
        }
        if let Some(raw) = self.job_type {
            filter = filter.with_type(raw.parse::<JobType>().map_err(invalid)?);
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(limit) = self.limit {
            filter = filter.with_limit(limit);
        }
        Ok(filter)
    }
}
