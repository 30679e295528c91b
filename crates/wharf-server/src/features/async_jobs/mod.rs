//! Async job API
//!
//! Queues post-load maintenance requests and reports their progress.

pub mod routes;

pub use routes::async_jobs_routes;
