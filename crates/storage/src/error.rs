//! Storage error types.

use crate::traits::Capability;
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("capability not supported by this backend: {capability}")]
    Unsupported { capability: Capability },

    #[error("signing error: {0}")]
    Signer(#[from] cask_signer::SignerError),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
