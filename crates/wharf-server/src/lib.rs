//! Wharf server library
//!
//! Warehouse upload orchestration: a Postgres-backed job queue feeding
//! load-file workers, a per-destination upload state machine, a runner for
//! post-load maintenance jobs and a small status API.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod api;
pub mod async_jobs;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod loader;
pub mod middleware;
pub mod notifier;
pub mod storage;
pub mod uploads;

pub use config::{Config, WarehouseMode};
pub use error::AppError;
