//! Metadata store trait and the SQLite implementation.

use crate::error::MetadataResult;
use crate::models::{BlobCursor, BlobRow, BlobUpsert};
use crate::repos::BlobRepo;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: BlobRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; avoids "database is locked" under concurrent requests.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs,
            "SQLite metadata store ready (query timeout is advisory)"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobRepo for SqliteStore {
    async fn get_blob(&self, workspace_id: &str, key: &str) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE workspace_id = ? AND key = ? AND deleted_at IS NULL",
        )
        .bind(workspace_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_blob(&self, blob: &BlobUpsert) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blobs (workspace_id, key, size, mime, status, upload_id, created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(workspace_id, key) DO UPDATE SET
                size = excluded.size,
                mime = excluded.mime,
                status = excluded.status,
                upload_id = excluded.upload_id,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
        )
        .bind(&blob.workspace_id)
        .bind(&blob.key)
        .bind(blob.size)
        .bind(&blob.mime)
        .bind(blob.status.as_str())
        .bind(&blob.upload_id)
        .bind(blob.updated_at)
        .bind(blob.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_blobs(&self, workspace_id: &str) -> MetadataResult<Vec<BlobRow>> {
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE workspace_id = ? AND status = 'completed' AND deleted_at IS NULL ORDER BY key",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn has_blobs(&self, workspace_id: &str) -> MetadataResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM blobs WHERE workspace_id = ? AND deleted_at IS NULL LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn delete_blob(&self, workspace_id: &str, key: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE workspace_id = ? AND key = ?")
            .bind(workspace_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete_blob(
        &self,
        workspace_id: &str,
        key: &str,
        deleted_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE blobs SET deleted_at = ?, updated_at = ? WHERE workspace_id = ? AND key = ? AND deleted_at IS NULL",
        )
        .bind(deleted_at)
        .bind(deleted_at)
        .bind(workspace_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_deleted_blobs(&self, workspace_id: &str) -> MetadataResult<Vec<BlobRow>> {
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE workspace_id = ? AND deleted_at IS NOT NULL ORDER BY key",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn total_size(&self, workspace_id: &str) -> MetadataResult<u64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0) FROM blobs WHERE workspace_id = ? AND status = 'completed' AND deleted_at IS NULL",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn list_expired_pending(
        &self,
        before: OffsetDateTime,
        after: Option<&BlobCursor>,
        limit: u32,
    ) -> MetadataResult<Vec<BlobRow>> {
        let rows = match after {
            Some(cursor) => {
                sqlx::query_as::<_, BlobRow>(
                    r#"
                    SELECT * FROM blobs
                    WHERE status = 'pending' AND created_at < ?
                      AND (workspace_id > ? OR (workspace_id = ? AND key > ?))
                    ORDER BY workspace_id, key
                    LIMIT ?
                    "#,
                )
                .bind(before)
                .bind(&cursor.workspace_id)
                .bind(&cursor.workspace_id)
                .bind(&cursor.key)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, BlobRow>(
                    r#"
                    SELECT * FROM blobs
                    WHERE status = 'pending' AND created_at < ?
                    ORDER BY workspace_id, key
                    LIMIT ?
                    "#,
                )
                .bind(before)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }
}

/// SQLite schema (applied on connect).
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS blobs (
    workspace_id TEXT NOT NULL,
    key TEXT NOT NULL,
    size INTEGER NOT NULL,
    mime TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed')),
    upload_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    PRIMARY KEY (workspace_id, key)
);
CREATE INDEX IF NOT EXISTS idx_blobs_pending_created ON blobs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_blobs_deleted ON blobs(workspace_id, deleted_at);
"#;
