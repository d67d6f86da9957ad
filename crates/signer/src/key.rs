//! HMAC key material.

use crate::error::{SignerError, SignerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// A shared secret used for HMAC-SHA256 signatures.
///
/// The key is the raw UTF-8 bytes of the configured string, so tokens produced
/// here verify against any other HMAC-SHA256 implementation keyed the same way.
#[derive(Clone)]
pub struct SignKey {
    mac: HmacSha256,
}

impl SignKey {
    /// Create a key from its configured string form. Empty keys are rejected.
    pub fn new(key: impl AsRef<str>) -> SignerResult<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(SignerError::InvalidKey("sign key is empty".to_string()));
        }
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Start a MAC computation keyed with this secret.
    pub(crate) fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }
}

impl fmt::Debug for SignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignKey([REDACTED])")
    }
}
