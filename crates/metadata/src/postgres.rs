//! PostgreSQL-based metadata store implementation.

use crate::error::MetadataResult;
use crate::models::{BlobCursor, BlobRow, BlobUpsert};
use crate::repos::BlobRepo;
use crate::store::MetadataStore;
use async_trait::async_trait;
use cask_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters,
    /// so the password can come from its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!(timeout_ms, "PostgreSQL statement_timeout set");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements hold one command each.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobRepo for PostgresStore {
    async fn get_blob(&self, workspace_id: &str, key: &str) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE workspace_id = $1 AND key = $2 AND deleted_at IS NULL",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, NULL)
            ON CONFLICT (workspace_id, key) DO UPDATE SET
                size = EXCLUDED.size,
                mime = EXCLUDED.mime,
                status = EXCLUDED.status,
                upload_id = EXCLUDED.upload_id,
                updated_at = EXCLUDED.updated_at,
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
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_blobs(&self, workspace_id: &str) -> MetadataResult<Vec<BlobRow>> {
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE workspace_id = $1 AND status = 'completed' AND deleted_at IS NULL ORDER BY key",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn has_blobs(&self, workspace_id: &str) -> MetadataResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM blobs WHERE workspace_id = $1 AND deleted_at IS NULL)",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn delete_blob(&self, workspace_id: &str, key: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE workspace_id = $1 AND key = $2")
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
            "UPDATE blobs SET deleted_at = $1, updated_at = $1 WHERE workspace_id = $2 AND key = $3 AND deleted_at IS NULL",
        )
        .bind(deleted_at)
        .bind(workspace_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_deleted_blobs(&self, workspace_id: &str) -> MetadataResult<Vec<BlobRow>> {
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE workspace_id = $1 AND deleted_at IS NOT NULL ORDER BY key",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn total_size(&self, workspace_id: &str) -> MetadataResult<u64> {
        // SUM(BIGINT) is NUMERIC in PostgreSQL.
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0)::BIGINT FROM blobs WHERE workspace_id = $1 AND status = 'completed' AND deleted_at IS NULL",
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
        let limit = i64::from(limit);
        let rows = match after {
            Some(cursor) => {
                sqlx::query_as::<_, BlobRow>(
                    r#"
                    SELECT * FROM blobs
                    WHERE status = 'pending' AND created_at < $1
                      AND (workspace_id, key) > ($2, $3)
                    ORDER BY workspace_id, key
                    LIMIT $4
                    "#,
                )
                .bind(before)
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
                    WHERE status = 'pending' AND created_at < $1
                    ORDER BY workspace_id, key
                    LIMIT $2
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_skip_comments() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        assert!(!statements.is_empty());
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS blobs"));
        assert!(statements.iter().all(|s| !s.ends_with(';')));
    }

    #[test]
    fn test_comment_only_chunks_are_dropped() {
        let statements = postgres_schema_statements("-- header\n;\nSELECT 1;\n-- trailer\n");
        assert_eq!(statements, vec!["SELECT 1"]);
    }
}
