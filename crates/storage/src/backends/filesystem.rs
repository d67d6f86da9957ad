//! Local filesystem storage backend.
//!
//! Suitable for development and single-node deployments. Offers none of the
//! optional upload capabilities, so clients always upload through the server.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, GetObject, ListedObject, ObjectMeta, PutMetadata, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Marker embedded in in-flight temp file names.
const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem blob store.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path inside the root, off the async runtime.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let suffix = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{suffix}", n.to_string_lossy()))
                .unwrap_or(suffix),
        )
    }

    /// Stream `body` into a temp file, fsync, then rename over `path`.
    async fn write_atomic(&self, path: &Path, mut body: ByteStream) -> StorageResult<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path_for(path);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok::<_, StorageError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                fs::rename(&temp_path, path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    fn relative_key(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

/// Map `key` under `root`, refusing anything that could land outside it.
///
/// Besides lexical checks this resolves symlinks on the path itself, or on its
/// nearest existing ancestor for keys that do not exist yet.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }

    let path = root.join(key);
    let root_canonical = root.canonicalize().map_err(|e| {
        StorageError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to canonicalize root: {e}"),
        ))
    })?;

    let mut candidate = Some(path.as_path());
    while let Some(current) = candidate {
        match std::fs::symlink_metadata(current) {
            Ok(meta) => {
                let canonical = current.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("symlink target missing or invalid: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                candidate = current.parent();
            }
            Err(e) => return Err(StorageError::Io(e)),
        }
    }

    Ok(path)
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    #[instrument(skip(self, data, _metadata), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _metadata: &PutMetadata) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.write_atomic(&path, crate::traits::bytes_stream(data))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, body, _metadata), fields(backend = "filesystem"))]
    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        _metadata: &PutMetadata,
    ) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        let written = self.write_atomic(&path, body).await?;
        tracing::debug!(key = %key, bytes = written, "Stored streamed object");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let path = self.key_path(key).await?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(ObjectMeta {
                size: metadata.len(),
                content_type: None,
                last_modified: metadata.modified().ok().map(Into::into),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str, _signed_url: bool) -> StorageResult<GetObject> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(GetObject::NotFound),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(GetObject::NotFound);
        }

        let meta = ObjectMeta {
            size: metadata.len(),
            content_type: None,
            last_modified: metadata.modified().ok().map(Into::into),
        };

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(GetObject::Body {
            meta,
            stream: Box::pin(stream),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ListedObject>> {
        // Prefixes are directories ("ws/"); list the directory they name.
        let dir_key = prefix.trim_end_matches('/');
        let base_path = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir_key).await?
        };

        let mut results = Vec::new();
        match fs::metadata(&base_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(results),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks; symlinks are skipped
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && !entry.file_name().to_string_lossy().contains(TEMP_MARKER)
                    && let Some(key) = self.relative_key(&path)
                    && key.starts_with(prefix)
                {
                    let metadata = entry.metadata().await?;
                    results.push(ListedObject {
                        key,
                        size: metadata.len(),
                        last_modified: metadata.modified().ok().map(Into::into),
                    });
                }
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}
