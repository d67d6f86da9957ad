//! Signer error types.

use thiserror::Error;

/// Signing operation errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid sign key: {0}")]
    InvalidKey(String),

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("verification failed")]
    VerificationFailed,
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
