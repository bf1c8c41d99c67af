//! Configuration management

use std::time::Duration;

use crate::db::DbConfig;
use crate::storage::{StorageConfig, MIN_PART_SIZE};
use crate::upload::{AbortPolicy, PoolConfig};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default bind address; the RPC surface is meant for local clients only.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 9000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default ledger location, relative to the working directory.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://ferry.db";

/// Default maximum ledger connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 8;

/// Default number of parallel upload workers.
pub const DEFAULT_UPLOAD_WORKERS: usize = 10;

/// Default multipart chunk size in MiB.
pub const DEFAULT_UPLOAD_CHUNK_MB: u64 = 32;

/// Default remote platform URL for local development.
pub const DEFAULT_PLATFORM_URL: &str = "http://localhost:8000/api/v1";

/// Default platform request timeout in seconds.
pub const DEFAULT_PLATFORM_TIMEOUT_SECS: u64 = 60;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub platform: PlatformConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub workers: usize,
    pub chunk_mb: u64,
}

#[derive(Clone)]
pub struct PlatformConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `.env`, the environment, and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: std::env::var("FERRY_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("FERRY_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "FERRY_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: std::env::var("FERRY_DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "FERRY_DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
            },
            upload: UploadConfig {
                workers: env_or("FERRY_UPLOAD_WORKERS", DEFAULT_UPLOAD_WORKERS),
                chunk_mb: env_or("FERRY_UPLOAD_CHUNK_MB", DEFAULT_UPLOAD_CHUNK_MB),
            },
            platform: PlatformConfig {
                url: std::env::var("FERRY_PLATFORM_URL")
                    .unwrap_or_else(|_| DEFAULT_PLATFORM_URL.to_string()),
                token: std::env::var("FERRY_PLATFORM_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty()),
                timeout_secs: env_or("FERRY_PLATFORM_TIMEOUT_SECS", DEFAULT_PLATFORM_TIMEOUT_SECS),
            },
            storage: StorageConfig::from_env(),
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

        if self.database.max_connections < 2 {
            anyhow::bail!(
                "Database max_connections must be at least 2 (got {}): uploads stream rows while status updates are written",
                self.database.max_connections
            );
        }

        if self.upload.workers == 0 {
            anyhow::bail!("FERRY_UPLOAD_WORKERS must be greater than 0");
        }

        if self.upload.chunk_mb * 1024 * 1024 < MIN_PART_SIZE {
            anyhow::bail!(
                "FERRY_UPLOAD_CHUNK_MB must be at least 5 (got {})",
                self.upload.chunk_mb
            );
        }

        if self.platform.url.is_empty() {
            anyhow::bail!("FERRY_PLATFORM_URL cannot be empty");
        }

        if self.storage.bucket.is_empty() {
            anyhow::bail!("S3_BUCKET cannot be empty");
        }

        if !self.server.host.starts_with("127.") && self.server.host != "localhost" {
            tracing::warn!(host = %self.server.host, "RPC surface bound to a non-loopback address");
        }

        if self.platform.token.is_none() {
            tracing::warn!("FERRY_PLATFORM_TOKEN not set - platform requests are unauthenticated");
        }

        Ok(())
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            url: self.database.url.clone(),
            max_connections: self.database.max_connections,
            ..Default::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.upload.workers,
            part_size: self.upload.chunk_mb * 1024 * 1024,
            abort: AbortPolicy::default(),
        }
    }

    pub fn platform_timeout(&self) -> Duration {
        Duration::from_secs(self.platform.timeout_secs)
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
            },
            upload: UploadConfig {
                workers: DEFAULT_UPLOAD_WORKERS,
                chunk_mb: DEFAULT_UPLOAD_CHUNK_MB,
            },
            platform: PlatformConfig {
                url: DEFAULT_PLATFORM_URL.to_string(),
                token: None,
                timeout_secs: DEFAULT_PLATFORM_TIMEOUT_SECS,
            },
            storage: StorageConfig::for_minio("http://localhost:9001", "ferry-uploads"),
        }
    }
}
