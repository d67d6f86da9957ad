//! Capability tokens and CDN URL signatures.
//!
//! A capability token binds an upload route to an ordered list of request
//! fields and an absolute expiry:
//!
//! ```text
//! canonical = path \n field_1 \n ... \n field_n \n exp
//! token     = "{exp}-{base64(HMAC_SHA256(key, canonical))}"
//! ```
//!
//! CDN signatures cover the URL pathname followed by a unix timestamp and are
//! emitted as `"{ts}-{base64(HMAC_SHA256(key, pathname + ts))}"`.

use crate::error::{SignerError, SignerResult};
use crate::key::SignKey;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::Mac;

/// Build the canonical string covered by a capability token.
///
/// Absent fields contribute an empty line so that field positions never shift.
pub fn canonical_string(path: &str, fields: &[Option<&str>], exp: i64) -> String {
    let mut canonical = String::from(path);
    for field in fields {
        canonical.push('\n');
        canonical.push_str(field.unwrap_or(""));
    }
    canonical.push('\n');
    canonical.push_str(&exp.to_string());
    canonical
}

/// Signs and verifies field-bound capability tokens.
#[derive(Clone, Debug)]
pub struct CapabilitySigner {
    key: SignKey,
}

impl CapabilitySigner {
    /// Create a new signer from a key.
    pub fn new(key: SignKey) -> Self {
        Self { key }
    }

    /// Create from the configured key string.
    pub fn from_secret(secret: impl AsRef<str>) -> SignerResult<Self> {
        Ok(Self::new(SignKey::new(secret)?))
    }

    fn sign_payload(&self, payload: &[u8]) -> String {
        let mut mac = self.key.mac();
        mac.update(payload);
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Produce the token for `path` bound to `fields` until `exp` (unix seconds).
    pub fn sign_token(&self, path: &str, fields: &[Option<&str>], exp: i64) -> String {
        let canonical = canonical_string(path, fields, exp);
        format!("{exp}-{}", self.sign_payload(canonical.as_bytes()))
    }

    /// Verify a presented token against the recomputed canonical string.
    ///
    /// The MAC comparison is constant time. Expiry is not checked here; callers
    /// reject expired `exp` values before verifying.
    pub fn verify_token(
        &self,
        path: &str,
        fields: &[Option<&str>],
        exp: i64,
        token: &str,
    ) -> SignerResult<()> {
        let (token_exp, signature) = token
            .split_once('-')
            .ok_or_else(|| SignerError::MalformedToken("expected 'exp-signature'".to_string()))?;

        if token_exp != exp.to_string() {
            return Err(SignerError::VerificationFailed);
        }

        let signature = STANDARD
            .decode(signature)
            .map_err(|e| SignerError::MalformedToken(format!("invalid base64: {e}")))?;

        let canonical = canonical_string(path, fields, exp);
        let mut mac = self.key.mac();
        mac.update(canonical.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SignerError::VerificationFailed)
    }

    /// Sign a CDN pathname at timestamp `ts`, yielding the `sign` query value.
    pub fn sign_cdn_path(&self, pathname: &str, ts: i64) -> String {
        let payload = format!("{pathname}{ts}");
        format!("{ts}-{}", self.sign_payload(payload.as_bytes()))
    }
}
