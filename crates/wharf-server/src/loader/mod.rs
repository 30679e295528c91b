//! Destination loaders
//!
//! The orchestrator and the async job runner only talk to destinations
//! through [`WarehouseLoader`]. Implementations are looked up by destination
//! type in a [`LoaderRegistry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::storage::StorageError;

pub mod postgres;

pub use postgres::PostgresLoader;

/// A generated load file for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoadFileRef {
    pub location: String,
    pub total_rows: i64,
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("No loader registered for destination type '{0}'")]
    UnknownDestination(String),

    #[error("Unsupported maintenance job '{0}'")]
    UnsupportedJob(String),

    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Invalid maintenance metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Load file {location} is malformed: {reason}")]
    MalformedLoadFile { location: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Destination query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Loads generated files into a destination and runs maintenance on it.
#[async_trait]
pub trait WarehouseLoader: Send + Sync {
    /// Loads `load_files` into `namespace.table`, returning rows loaded.
    async fn load_table(
        &self,
        namespace: &str,
        table: &str,
        load_files: &[LoadFileRef],
    ) -> Result<u64, LoaderError>;

    /// Runs a post-load operation such as clearing rows of a job run.
    async fn run_maintenance(
        &self,
        job_type: &str,
        namespace: &str,
        table: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), LoaderError>;
}

/// Loaders keyed by upper-cased destination type (`POSTGRES`, `SNOWFLAKE`, ...)
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn WarehouseLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        destination_type: impl AsRef<str>,
        loader: Arc<dyn WarehouseLoader>,
    ) -> Self {
        self.loaders
            .insert(destination_type.as_ref().to_uppercase(), loader);
        self
    }

    pub fn get(&self, destination_type: &str) -> Result<Arc<dyn WarehouseLoader>, LoaderError> {
        self.loaders
            .get(&destination_type.to_uppercase())
            .cloned()
            .ok_or_else(|| LoaderError::UnknownDestination(destination_type.to_string()))
    }

    pub fn destination_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.loaders.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Lower-cased identifier, or an error if it is not a plain SQL name.
pub fn sanitize_identifier(name: &str) -> Result<String, LoaderError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(name.to_ascii_lowercase())
    } else {
        Err(LoaderError::InvalidIdentifier(name.to_string()))
    }
}
