//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// The endpoint is unauthenticated; restrict it at the network level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:3010".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Proxy upload settings for backends that cannot hand browsers presigned PUTs.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyUploadConfig {
    /// Route uploads through the local proxy endpoint.
    #[serde(default)]
    pub enabled: bool,
    /// Public CDN origin used for signed GET redirects (e.g., "https://cdn.example.com").
    #[serde(default)]
    pub url_prefix: Option<String>,
    /// HMAC key shared by upload tokens and CDN signatures.
    /// WARNING: Prefer CASK_STORAGE__PROXY_UPLOAD__SIGN_KEY over storing in config.
    #[serde(default)]
    pub sign_key: Option<String>,
}

impl ProxyUploadConfig {
    fn sign_key_present(&self) -> bool {
        self.sign_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Whether presigned uploads should be relayed through the proxy endpoint.
    pub fn is_proxy_mode(&self) -> bool {
        self.enabled && self.sign_key_present()
    }

    /// Whether signed GETs should redirect to the CDN origin.
    pub fn is_cdn_signing(&self) -> bool {
        self.url_prefix.as_deref().is_some_and(|p| !p.is_empty()) && self.sign_key_present()
    }
}

impl fmt::Debug for ProxyUploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyUploadConfig")
            .field("enabled", &self.enabled)
            .field("url_prefix", &self.url_prefix)
            .field("sign_key", &self.sign_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage. Supports no presigned or multipart uploads.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient AWS credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient AWS credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
        /// Answer signed GETs with a presigned redirect instead of streaming.
        #[serde(default)]
        presigned_get: bool,
        /// Per-operation timeout in seconds.
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
        /// Connection establishment timeout in seconds.
        #[serde(default = "default_connect_timeout_secs")]
        connect_timeout_secs: u64,
        /// Optional proxy upload mode.
        #[serde(default)]
        proxy_upload: Option<ProxyUploadConfig>,
    },
    /// Cloudflare R2 (S3-compatible, account-scoped endpoint).
    R2 {
        /// Cloudflare account ID; the endpoint is derived from it.
        account_id: String,
        /// Bucket name.
        bucket: String,
        /// Optional key prefix.
        prefix: Option<String>,
        /// R2 access key ID.
        access_key_id: String,
        /// R2 secret access key.
        secret_access_key: String,
        /// Answer signed GETs with a presigned redirect instead of streaming.
        #[serde(default)]
        presigned_get: bool,
        /// Per-operation timeout in seconds.
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
        /// Connection establishment timeout in seconds.
        #[serde(default = "default_connect_timeout_secs")]
        connect_timeout_secs: u64,
        /// Optional proxy upload mode.
        #[serde(default)]
        proxy_upload: Option<ProxyUploadConfig>,
    },
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Backend kind as written in config.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem { .. } => "filesystem",
            Self::S3 { .. } => "s3",
            Self::R2 { .. } => "r2",
        }
    }

    /// Proxy upload settings, if any.
    pub fn proxy_upload(&self) -> Option<&ProxyUploadConfig> {
        match self {
            Self::Filesystem { .. } => None,
            Self::S3 { proxy_upload, .. } | Self::R2 { proxy_upload, .. } => {
                proxy_upload.as_ref()
            }
        }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            StorageConfig::R2 { account_id, .. } if account_id.trim().is_empty() => {
                Err("r2 config requires a non-empty account_id".to_string())
            }
            _ => Ok(()),
        }?;

        if let Some(proxy) = self.proxy_upload()
            && proxy.enabled
            && !proxy.is_proxy_mode()
        {
            return Err("proxy_upload.enabled requires a non-empty sign_key".to_string());
        }

        Ok(())
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (recommended for testing and small deployments only).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only, SQLite cannot cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer CASK_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Upload reaper configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Run the reaper on a schedule.
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,
    /// Seconds between runs (default: daily).
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// Age after which a pending upload is abandoned.
    #[serde(default = "default_reaper_ttl_secs")]
    pub ttl_secs: u64,
    /// Records fetched per batch.
    #[serde(default = "default_reaper_batch_size")]
    pub batch_size: u32,
}

fn default_reaper_enabled() -> bool {
    true
}

fn default_reaper_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_reaper_ttl_secs() -> u64 {
    crate::PENDING_UPLOAD_TTL_SECS
}

fn default_reaper_batch_size() -> u32 {
    500
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            interval_secs: default_reaper_interval_secs(),
            ttl_secs: default_reaper_ttl_secs(),
            batch_size: default_reaper_batch_size(),
        }
    }
}

impl ReaperConfig {
    /// Pending-upload TTL as a time::Duration.
    pub fn ttl(&self) -> time::Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        time::Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX))
    }

    /// Interval between runs as a std::time::Duration.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.interval_secs == 0 {
            return Err("reaper.interval_secs cannot be 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("reaper.batch_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Upload reaper configuration.
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            reaper: ReaperConfig {
                enabled: false,
                ..ReaperConfig::default()
            },
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage.validate().map_err(crate::Error::Config)?;
        self.metadata.validate().map_err(crate::Error::Config)?;
        self.reaper.validate().map_err(crate::Error::Config)?;
        Ok(())
    }
}
