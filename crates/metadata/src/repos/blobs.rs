//! Blob record repository trait.

use crate::error::MetadataResult;
use crate::models::{BlobCursor, BlobRow, BlobUpsert};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for blob records.
///
/// Reads exclude soft-deleted rows unless stated otherwise.
#[async_trait]
pub trait BlobRepo: Send + Sync {
    async fn get_blob(&self, workspace_id: &str, key: &str) -> MetadataResult<Option<BlobRow>>;

    /// Insert or replace a record, clearing any soft-delete marker.
    async fn upsert_blob(&self, blob: &BlobUpsert) -> MetadataResult<()>;

    /// Completed records of a workspace, ordered by key.
    async fn list_blobs(&self, workspace_id: &str) -> MetadataResult<Vec<BlobRow>>;

    /// Whether the workspace has any record at all, pending or completed.
    async fn has_blobs(&self, workspace_id: &str) -> MetadataResult<bool>;

    /// Remove a record. Returns whether a row existed.
    async fn delete_blob(&self, workspace_id: &str, key: &str) -> MetadataResult<bool>;

    /// Mark a record deleted without removing it.
    async fn soft_delete_blob(
        &self,
        workspace_id: &str,
        key: &str,
        deleted_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Soft-deleted records of a workspace.
    async fn list_deleted_blobs(&self, workspace_id: &str) -> MetadataResult<Vec<BlobRow>>;

    /// Sum of completed record sizes.
    async fn total_size(&self, workspace_id: &str) -> MetadataResult<u64>;

    /// Pending records created before `before`, ordered by `(workspace_id, key)`
    /// and starting strictly after `after` when given.
    async fn list_expired_pending(
        &self,
        before: OffsetDateTime,
        after: Option<&BlobCursor>,
        limit: u32,
    ) -> MetadataResult<Vec<BlobRow>>;
}
