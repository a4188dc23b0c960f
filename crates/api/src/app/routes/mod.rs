use axum::Router;
use axum::routing::{get, post};

pub mod imports;
pub mod jobs;
pub mod system;
pub mod webhooks;

pub fn router() -> Router {
    Router::new()
        .route("/imports", post(imports::upload))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/stream", get(jobs::stream_job))
        .route("/webhooks/:id/test", post(webhooks::test_subscription))
}
