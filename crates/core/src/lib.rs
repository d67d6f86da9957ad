//! Core domain types for the cask blob store.
//!
//! This crate defines the data model shared by every other crate:
//! - Blob status and workspace-scoped object keys
//! - Content hashes used as blob keys
//! - Application configuration
//! - Upload size and expiry constants

pub mod blob;
pub mod config;
pub mod error;
pub mod hash;

pub use blob::{BlobStatus, DEFAULT_MIME, WorkspaceKey, object_key, workspace_prefix};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};

/// Lifetime of presigned URLs and proxy upload tokens, in seconds.
pub const SIGNED_URL_EXPIRY_SECS: u64 = 60 * 60;

/// Fixed part size for multipart uploads: 5 MiB
pub const MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Blobs at or above this size are uploaded in parts: 10 MiB
pub const MULTIPART_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Pending uploads older than this are reaped: 24 hours
pub const PENDING_UPLOAD_TTL_SECS: u64 = 24 * 60 * 60;

/// Route prefix of the public proxy upload endpoints.
pub const STORAGE_PROXY_ROOT: &str = "/api/storage";

/// Single-object proxy upload route.
pub const PROXY_UPLOAD_PATH: &str = "/api/storage/upload";

/// Multipart part proxy upload route.
pub const PROXY_MULTIPART_PATH: &str = "/api/storage/multipart";

/// Number of parts needed for a blob of `size` bytes.
pub fn multipart_part_count(size: u64) -> u64 {
    size.div_ceil(MULTIPART_PART_SIZE)
}
