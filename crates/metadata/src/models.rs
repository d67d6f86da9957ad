//! Database models mapping to the metadata schema.

use cask_core::BlobStatus;
use sqlx::FromRow;
use time::OffsetDateTime;

/// One blob record, keyed by `(workspace_id, key)`.
#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    pub workspace_id: String,
    /// Content hash of the blob (unpadded base64url SHA-256).
    pub key: String,
    pub size: i64,
    pub mime: String,
    /// `pending` or `completed`.
    pub status: String,
    /// Open multipart upload, if any.
    pub upload_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Soft-delete marker.
    pub deleted_at: Option<OffsetDateTime>,
}

impl BlobRow {
    /// Parsed status. Unknown values are treated as pending.
    pub fn status(&self) -> BlobStatus {
        self.status.parse().unwrap_or(BlobStatus::Pending)
    }

    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    pub fn size_bytes(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }
}

/// Values written by [`crate::repos::BlobRepo::upsert_blob`].
///
/// On conflict the existing row keeps its `created_at`; everything else is
/// replaced and any soft-delete marker is cleared.
#[derive(Debug, Clone)]
pub struct BlobUpsert {
    pub workspace_id: String,
    pub key: String,
    pub size: i64,
    pub mime: String,
    pub status: BlobStatus,
    pub upload_id: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl BlobUpsert {
    pub fn completed(workspace_id: &str, key: &str, size: u64, mime: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            key: key.to_string(),
            size: i64::try_from(size).unwrap_or(i64::MAX),
            mime: mime.to_string(),
            status: BlobStatus::Completed,
            upload_id: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn pending(
        workspace_id: &str,
        key: &str,
        size: u64,
        mime: &str,
        upload_id: Option<String>,
    ) -> Self {
        Self {
            status: BlobStatus::Pending,
            upload_id,
            ..Self::completed(workspace_id, key, size, mime)
        }
    }

    /// Override the write timestamp (also used as `created_at` for new rows).
    pub fn at(mut self, updated_at: OffsetDateTime) -> Self {
        self.updated_at = updated_at;
        self
    }
}

/// Position in the `(workspace_id, key)` ordering used for batched scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCursor {
    pub workspace_id: String,
    pub key: String,
}

impl From<&BlobRow> for BlobCursor {
    fn from(row: &BlobRow) -> Self {
        Self {
            workspace_id: row.workspace_id.clone(),
            key: row.key.clone(),
        }
    }
}
