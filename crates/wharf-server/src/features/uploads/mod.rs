//! Upload status API
//!
//! Read-only views of uploads and their table breakdown.

pub mod queries;
pub mod routes;

pub use routes::uploads_routes;
