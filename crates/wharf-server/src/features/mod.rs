//! Feature modules implementing the status API
//!
//! - **uploads**: upload list and per-upload table breakdown
//! - **async_jobs**: queue post-load maintenance jobs and poll their status
//!
//! Queries implement `mediator::Request` and are dispatched from the route
//! handlers.

pub mod async_jobs;
pub mod shared;
pub mod uploads;

use axum::Router;

use crate::async_jobs::AsyncJobRunner;

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub db: sqlx::PgPool,
    pub async_jobs: AsyncJobRunner,
}

/// Mounts:
/// - `/uploads` - upload status
/// - `/warehouse/jobs` - async jobs
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .nest("/uploads", uploads::uploads_routes().with_state(state.db.clone()))
        .nest(
            "/warehouse/jobs",
            async_jobs::async_jobs_routes().with_state(state.async_jobs),
        )
}
