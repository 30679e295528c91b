//! Object storage for staging and load files
//!
//! Callers only see the [`FileManager`] capability. [`S3FileManager`] talks to
//! any S3-compatible service; [`MemoryFileManager`] keeps objects in process.

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;
pub mod memory;

pub use config::StorageConfig;
pub use memory::MemoryFileManager;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Upload and download objects by key.
///
/// Locations returned by [`FileManager::upload`] are what gets persisted in
/// the store; [`FileManager::object_key`] maps them back to keys.
#[async_trait]
pub trait FileManager: Send + Sync {
    /// Stores `data` under `key` and returns its location.
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String, StorageError>;

    /// Fetches an object by location or key.
    async fn download(&self, location: &str) -> Result<Vec<u8>, StorageError>;

    /// Key portion of a location such as `s3://bucket/a/b.json`.
    fn object_key(&self, location: &str) -> String;
}

#[derive(Clone)]
pub struct S3FileManager {
    client: Client,
    bucket: String,
}

impl S3FileManager {
    pub async fn new(config: StorageConfig) -> anyhow::Result<Self> {
        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => aws_sdk_s3::Config::builder()
                .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "wharf-storage",
                )),
            None => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, endpoint = ?config.endpoint, "S3 file manager initialized");

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        })
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl FileManager for S3FileManager {
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String, StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", key))?;

        debug!(bucket = %self.bucket, key, "Uploaded object");
        Ok(self.location(key))
    }

    #[instrument(skip(self))]
    async fn download(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.object_key(location);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service) if service.is_no_such_key() => StorageError::NotFound(key.clone()),
                _ => StorageError::Backend(
                    anyhow::Error::new(e).context(format!("Failed to download {}", key)),
                ),
            })?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!(key = %key, bytes = data.len(), "Downloaded object");
        Ok(data)
    }

    fn object_key(&self, location: &str) -> String {
        strip_location(location, "s3://")
    }
}

/// Drops `scheme://bucket/` from a location; bare keys pass through.
pub(crate) fn strip_location(location: &str, scheme: &str) -> String {
    match location.strip_prefix(scheme) {
        Some(rest) => rest
            .split_once('/')
            .map(|(_, key)| key.to_string())
            .unwrap_or_default(),
        None => location.to_string(),
    }
}
