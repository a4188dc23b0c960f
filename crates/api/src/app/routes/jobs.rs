use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio_stream::StreamExt;

use shelfsync_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::JobListQuery>,
) -> axum::response::Response {
    let filter = match query.into_filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    match services.reader.list(&filter).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn get_job(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.reader.get(job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

/// GET /jobs/:id/stream
///
/// Server-sent `progress` events, one per observed change, ending after the
/// terminal snapshot.
pub async fn stream_job(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.reader.get(job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => return errors::job_store_error_to_response(e),
    }

    let events = services.reader.watch(job_id).map(|snapshot| match snapshot {
        Ok(job) => SseEvent::default().event("progress").json_data(&job),
        Err(e) => Ok(SseEvent::default().event("error").data(e.to_string())),
    });

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
        .into_response()
}
