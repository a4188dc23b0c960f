use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use shelfsync_infra::intake::IntakeError;
use shelfsync_infra::jobs::JobStoreError;

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn intake_error_to_response(err: IntakeError) -> axum::response::Response {
    match err {
        IntakeError::InvalidUpload(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_upload", msg),
        e @ IntakeError::TooLarge { .. } => json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", e.to_string()),
        e @ IntakeError::SubscriptionNotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        IntakeError::Queue(e) => {
            tracing::error!(error = %e, "enqueue failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string())
        }
        e @ (IntakeError::Jobs(_) | IntakeError::Staging(_) | IntakeError::Subscriptions(_)) => {
            tracing::error!(error = %e, "intake failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn job_store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        e => {
            tracing::error!(error = %e, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}
