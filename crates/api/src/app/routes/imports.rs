use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Multipart};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use shelfsync_infra::jobs::JobStatus;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

const FILE_FIELD: &str = "file";

/// POST /imports
///
/// Multipart upload with a `file` field holding a `.csv`. Answers `202` as
/// soon as the job is queued; progress is read from `/jobs/:id`.
pub async fn upload(Extension(services): Extension<Arc<AppServices>>, mut multipart: Multipart) -> axum::response::Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return errors::json_error(e.status(), "invalid_upload", e.body_text()),
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return errors::json_error(e.status(), "invalid_upload", e.body_text()),
        };

        return match services.intake.stage_and_enqueue_import(&filename, &bytes).await {
            Ok(job_id) => (
                StatusCode::ACCEPTED,
                Json(dto::JobAccepted {
                    job_id,
                    status: JobStatus::Pending,
                }),
            )
                .into_response(),
            Err(e) => errors::intake_error_to_response(e),
        };
    }

    errors::json_error(
        StatusCode::BAD_REQUEST,
        "invalid_upload",
        "multipart field `file` is required",
    )
}
