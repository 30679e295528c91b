//! Wharf Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared building blocks for the Wharf workspace members:
//!
//! - **Error Handling**: [`WharfError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//! - **Backoff**: capped exponential delays with optional jitter
//!
//! # Example
//!
//! ```no_run
//! use wharf_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod error;
pub mod logging;

pub use backoff::Backoff;
pub use error::{Result, WharfError};
