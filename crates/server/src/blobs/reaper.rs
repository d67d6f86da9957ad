//! Removal of pending uploads that were never completed.

use super::BlobStore;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use cask_core::config::ReaperConfig;
use cask_metadata::{BlobCursor, BlobRepo, BlobRow};
use cask_storage::{StorageError, Support};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

/// Counters for one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaperStats {
    pub processed: u64,
    pub aborted: u64,
    pub deleted: u64,
    pub errors: u64,
}

/// Periodic sweep of expired pending blobs.
///
/// Each expired record has its multipart upload aborted (when it has one)
/// and is then permanently deleted. A record whose abort or delete fails is
/// kept for the next run. Per-blob failures are counted and the sweep moves
/// on.
pub struct UploadReaper {
    blobs: BlobStore,
    config: ReaperConfig,
}

impl UploadReaper {
    pub fn new(blobs: BlobStore, config: ReaperConfig) -> Self {
        Self { blobs, config }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Reap every pending record created before `now - ttl`.
    #[instrument(skip(self))]
    pub async fn run(&self, now: OffsetDateTime) -> ApiResult<ReaperStats> {
        let cutoff = now - self.config.ttl();
        let batch_size = self.config.batch_size.max(1);
        let mut stats = ReaperStats::default();
        let mut cursor: Option<BlobCursor> = None;

        loop {
            let batch = self
                .blobs
                .metadata()
                .list_expired_pending(cutoff, cursor.as_ref(), batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(BlobCursor::from(last));

            for row in &batch {
                self.reap(row, &mut stats).await;
            }

            if batch.len() < batch_size as usize {
                break;
            }
        }

        metrics::REAPER_RUNS.inc();
        metrics::REAPER_ABORTED.inc_by(stats.aborted);
        metrics::REAPER_DELETED.inc_by(stats.deleted);
        metrics::REAPER_ERRORS.inc_by(stats.errors);

        if stats.processed > 0 {
            info!(
                processed = stats.processed,
                aborted = stats.aborted,
                deleted = stats.deleted,
                errors = stats.errors,
                "Reaped expired uploads"
            );
        }
        Ok(stats)
    }

    async fn reap(&self, row: &BlobRow, stats: &mut ReaperStats) {
        stats.processed += 1;

        if let Some(upload_id) = row.upload_id.as_deref() {
            match self
                .blobs
                .abort_multipart_upload(&row.workspace_id, &row.key, upload_id)
                .await
            {
                Ok(Support::Supported(())) => stats.aborted += 1,
                Ok(Support::Unsupported(_)) => {
                    debug!(key = %row.key, "Backend has no multipart uploads to abort");
                }
                Err(ApiError::Storage(StorageError::NotFound(_))) => {
                    debug!(key = %row.key, upload_id = %upload_id, "Multipart upload already gone");
                }
                Err(e) => {
                    // The row is the only record of the upload id; keep it for the next run
                    warn!(
                        workspace_id = %row.workspace_id,
                        key = %row.key,
                        upload_id = %upload_id,
                        error = %e,
                        "Failed to abort multipart upload"
                    );
                    stats.errors += 1;
                    return;
                }
            }
        }

        match self.blobs.delete(&row.workspace_id, &row.key, true).await {
            Ok(()) => stats.deleted += 1,
            Err(e) => {
                warn!(
                    workspace_id = %row.workspace_id,
                    key = %row.key,
                    error = %e,
                    "Failed to delete expired upload"
                );
                stats.errors += 1;
            }
        }
    }
}
