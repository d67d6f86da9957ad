//! HMAC signing for proxy uploads and CDN URLs.
//!
//! This crate provides:
//! - Sign key handling with redacted debug output
//! - Field-bound capability tokens for the upload proxy
//! - CDN URL signatures for signed GET redirects

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::SignKey;
pub use signer::{CapabilitySigner, canonical_string};
