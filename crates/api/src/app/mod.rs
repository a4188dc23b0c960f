//! Axum router and service wiring.
//!
//! - `services.rs`: stores, queue and worker pool behind one handle
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response shapes
//! - `errors.rs`: JSON error responses

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Multipart framing on top of the raw file size.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Build the full HTTP router (used by `main.rs` and the black-box tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let body_limit = services
        .intake
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(body_limit))
                .layer(Extension(services)),
        )
}
