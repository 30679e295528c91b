//! Configuration management
//!
//! Everything is read from the environment (optionally seeded from `.env`).
//! Component-level settings live next to the component that uses them
//! ([`NotifierConfig`], [`UploadConfig`], [`AsyncJobConfig`]) and are
//! assembled here.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::async_jobs::AsyncJobConfig;
use crate::notifier::NotifierConfig;
use crate::uploads::UploadConfig;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8082;

/// Default time allowed for background tasks to drain on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/wharf";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 20;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Which parts of the warehouse service this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseMode {
    /// Orchestration, workers and the status API in one process
    #[default]
    Embedded,
    /// Scheduler, orchestrators, reaper, async jobs and API; no job workers
    Master,
    /// Job workers only
    Slave,
    /// Nothing but the status API
    Off,
}

impl WarehouseMode {
    pub fn runs_orchestration(self) -> bool {
        matches!(self, WarehouseMode::Embedded | WarehouseMode::Master)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, WarehouseMode::Embedded | WarehouseMode::Slave)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WarehouseMode::Embedded => "embedded",
            WarehouseMode::Master => "master",
            WarehouseMode::Slave => "slave",
            WarehouseMode::Off => "off",
        }
    }
}

impl FromStr for WarehouseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "embedded" => Ok(WarehouseMode::Embedded),
            "master" => Ok(WarehouseMode::Master),
            "slave" => Ok(WarehouseMode::Slave),
            "off" => Ok(WarehouseMode::Off),
            other => Err(anyhow::anyhow!("Invalid WAREHOUSE_MODE: {}", other)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub mode: WarehouseMode,
    pub notifier: NotifierConfig,
    pub uploads: UploadConfig,
    pub async_jobs: AsyncJobConfig,
    pub destinations: DestinationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Connection settings for destination loaders
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DestinationConfig {
    /// Target database for `POSTGRES` destinations; falls back to `DATABASE_URL`
    pub postgres_url: Option<String>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let notifier_defaults = NotifierConfig::default();
        let upload_defaults = UploadConfig::default();
        let async_defaults = AsyncJobConfig::default();

        let mode = match std::env::var("WAREHOUSE_MODE") {
            Ok(value) => value.parse()?,
            Err(_) => WarehouseMode::default(),
        };

        let config = Config {
            server: ServerConfig {
                host: std::env::var("WHARF_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("WHARF_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "GRACEFUL_SHUTDOWN_TIMEOUT_SECS",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DB_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DB_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DB_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DB_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", false),
            },
            mode,
            notifier: NotifierConfig {
                workers: env_or("NOTIFIER_WORKERS", notifier_defaults.workers),
                poll_interval_ms: env_or(
                    "NOTIFIER_POLL_INTERVAL_MS",
                    notifier_defaults.poll_interval_ms,
                ),
                lease_secs: env_or("NOTIFIER_LEASE_SECS", notifier_defaults.lease_secs),
                max_attempts: env_or("NOTIFIER_MAX_ATTEMPTS", notifier_defaults.max_attempts),
                reaper_interval_secs: env_or(
                    "NOTIFIER_REAPER_INTERVAL_SECS",
                    notifier_defaults.reaper_interval_secs,
                ),
            },
            uploads: UploadConfig {
                max_attempts: env_or("UPLOAD_MAX_ATTEMPTS", upload_defaults.max_attempts),
                retry_base_secs: env_or("UPLOAD_RETRY_BASE_SECS", upload_defaults.retry_base_secs),
                retry_cap_secs: env_or("UPLOAD_RETRY_CAP_SECS", upload_defaults.retry_cap_secs),
                max_parallel_uploads: env_or(
                    "UPLOAD_MAX_PARALLEL",
                    upload_defaults.max_parallel_uploads,
                ),
                max_parallel_loads: env_or(
                    "UPLOAD_MAX_PARALLEL_LOADS",
                    upload_defaults.max_parallel_loads,
                ),
                scheduler_interval_secs: env_or(
                    "UPLOAD_SCHEDULER_INTERVAL_SECS",
                    upload_defaults.scheduler_interval_secs,
                ),
                staging_files_batch_size: env_or(
                    "UPLOAD_STAGING_FILES_BATCH_SIZE",
                    upload_defaults.staging_files_batch_size,
                ),
                lock_lease_secs: env_or("UPLOAD_LOCK_LEASE_SECS", upload_defaults.lock_lease_secs),
                load_file_prefix: std::env::var("UPLOAD_LOAD_FILE_PREFIX")
                    .unwrap_or(upload_defaults.load_file_prefix),
            },
            async_jobs: AsyncJobConfig {
                batch_size: env_or("ASYNC_JOB_BATCH_SIZE", async_defaults.batch_size),
                max_attempts: env_or("ASYNC_JOB_MAX_ATTEMPTS", async_defaults.max_attempts),
                timeout_secs: env_or("ASYNC_JOB_TIMEOUT_SECS", async_defaults.timeout_secs),
                retry_interval_secs: env_or(
                    "ASYNC_JOB_RETRY_INTERVAL_SECS",
                    async_defaults.retry_interval_secs,
                ),
            },
            destinations: DestinationConfig {
                postgres_url: std::env::var("WAREHOUSE_POSTGRES_URL").ok(),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        self.notifier.validate()?;
        self.uploads.validate()?;
        self.async_jobs.validate()?;

        if self.uploads.lock_lease_secs <= self.uploads.scheduler_interval_secs {
            tracing::warn!(
                lock_lease_secs = self.uploads.lock_lease_secs,
                scheduler_interval_secs = self.uploads.scheduler_interval_secs,
                "Upload lock lease is not longer than the scheduler interval"
            );
        }

        Ok(())
    }

    /// Database URL used by `POSTGRES` destination loaders
    pub fn postgres_destination_url(&self) -> &str {
        self.destinations
            .postgres_url
            .as_deref()
            .unwrap_or(&self.database.url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: false,
            },
            mode: WarehouseMode::default(),
            notifier: NotifierConfig::default(),
            uploads: UploadConfig::default(),
            async_jobs: AsyncJobConfig::default(),
            destinations: DestinationConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("MASTER".parse::<WarehouseMode>().unwrap(), WarehouseMode::Master);
        assert_eq!(" slave ".parse::<WarehouseMode>().unwrap(), WarehouseMode::Slave);
        assert!("primary".parse::<WarehouseMode>().is_err());
    }

    #[test]
    fn test_mode_roles() {
        assert!(WarehouseMode::Embedded.runs_orchestration());
        assert!(WarehouseMode::Embedded.runs_workers());
        assert!(WarehouseMode::Master.runs_orchestration());
        assert!(!WarehouseMode::Master.runs_workers());
        assert!(!WarehouseMode::Slave.runs_orchestration());
        assert!(WarehouseMode::Slave.runs_workers());
        assert!(!WarehouseMode::Off.runs_orchestration());
        assert!(!WarehouseMode::Off.runs_workers());
    }

    #[test]
    fn test_invalid_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_destination_url_falls_back_to_database() {
        let mut config = Config::default();
        assert_eq!(config.postgres_destination_url(), DEFAULT_DATABASE_URL);
        config.destinations.postgres_url = Some("postgresql://warehouse/db".to_string());
        assert_eq!(config.postgres_destination_url(), "postgresql://warehouse/db");
    }
}
