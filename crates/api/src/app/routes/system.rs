use std::sync::Arc;

use axum::Json;
use axum::extract::Extension;
use axum::response::IntoResponse;

use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "backend": services.backend.as_str(),
        "workers": services.pool_stats(),
    }))
}
