//! Blob storage backends for Cask.
//!
//! This crate provides:
//! - The [`StorageBackend`] trait with optional presign, multipart and
//!   proxy-upload capabilities
//! - Backends: local filesystem and S3-compatible (including R2)
//! - [`ProxyBackend`], a decorator that relays uploads through the server and
//!   signs CDN reads
//! - [`BackendHandle`] for lazy construction and hot reconfiguration

pub mod backends;
pub mod error;
pub mod handle;
pub mod traits;

pub use backends::{
    filesystem::FilesystemBackend,
    proxy::ProxyBackend,
    s3::{S3Backend, S3Settings},
};
pub use error::{StorageError, StorageResult};
pub use handle::BackendHandle;
pub use traits::{
    ByteStream, Capability, CapabilitySet, GetObject, ListedObject, MultipartCapability,
    MultipartInit, MultipartPart, ObjectMeta, PresignCapability, PresignedUpload,
    ProxyUploadCapability, PutMetadata, StorageBackend, StorageBackendExt, Support,
    bytes_stream, collect_stream,
};

use cask_core::config::StorageConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create a storage backend from configuration.
///
/// S3 and R2 backends are wrapped in a [`ProxyBackend`] when a
/// `proxy_upload` section is present.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    config.validate().map_err(StorageError::Config)?;

    let backend: Arc<dyn StorageBackend> = match config {
        StorageConfig::Filesystem { path } => Arc::new(FilesystemBackend::new(path).await?),
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
            presigned_get,
            request_timeout_secs,
            connect_timeout_secs,
            ..
        } => {
            let settings = S3Settings {
                endpoint: endpoint.clone(),
                region: region.clone(),
                prefix: prefix.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: *force_path_style,
                presigned_get: *presigned_get,
                request_timeout: Duration::from_secs(*request_timeout_secs),
                connect_timeout: Duration::from_secs(*connect_timeout_secs),
                ..S3Settings::new(bucket.clone())
            };
            Arc::new(S3Backend::new(settings).await?)
        }
        StorageConfig::R2 {
            account_id,
            bucket,
            prefix,
            access_key_id,
            secret_access_key,
            presigned_get,
            request_timeout_secs,
            connect_timeout_secs,
            ..
        } => {
            let settings = S3Settings {
                prefix: prefix.clone(),
                presigned_get: *presigned_get,
                request_timeout: Duration::from_secs(*request_timeout_secs),
                connect_timeout: Duration::from_secs(*connect_timeout_secs),
                ..S3Settings::r2(
                    account_id,
                    bucket.clone(),
                    access_key_id.clone(),
                    secret_access_key.clone(),
                )
            };
            Arc::new(S3Backend::new(settings).await?)
        }
    };

    match config.proxy_upload() {
        Some(proxy) => Ok(Arc::new(ProxyBackend::new(backend, proxy)?)),
        None => Ok(backend),
    }
}
