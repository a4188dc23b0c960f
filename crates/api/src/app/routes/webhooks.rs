use std::sync::Arc;

use axum::Json;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use shelfsync_core::SubscriptionId;
use shelfsync_infra::jobs::JobStatus;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// POST /webhooks/:id/test
pub async fn test_subscription(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let subscription_id = match id.parse::<SubscriptionId>() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid subscription id"),
    };

    match services.intake.enqueue_webhook_test(subscription_id).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(dto::JobAccepted {
                job_id,
                status: JobStatus::Pending,
            }),
        )
            .into_response(),
        Err(e) => errors::intake_error_to_response(e),
    }
}
