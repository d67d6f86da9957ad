//! Blob orchestration: records in the metadata store, bytes in the storage
//! backend, and content-hash verification tying the two together.
//!
//! Every backend object lives at `"{workspace_id}/{key}"`, where `key` is the
//! unpadded base64url SHA-256 of the bytes. A record only becomes `completed`
//! after [`BlobStore::complete`] has hashed the stored object.

pub mod events;
pub mod reaper;

pub use events::{BlobEvent, BlobEvents};
pub use reaper::{ReaperStats, UploadReaper};

use crate::error::{ApiError, ApiResult};
use crate::metrics::record_completion;
use bytes::Bytes;
use cask_core::{
    ContentHash, DEFAULT_MIME, MULTIPART_PART_SIZE, MULTIPART_THRESHOLD, SIGNED_URL_EXPIRY_SECS,
    object_key, workspace_prefix,
};
use cask_metadata::{BlobRepo, BlobRow, BlobUpsert, MetadataStore};
use cask_storage::{
    BackendHandle, ByteStream, GetObject, MultipartInit, MultipartPart, ObjectMeta,
    PresignedUpload, PutMetadata, StorageBackend, StorageBackendExt, StorageResult, Support,
};
use futures::StreamExt;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// A blob as reported by [`BlobStore::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: String,
    pub size: u64,
    pub mime: String,
    pub updated_at: Option<OffsetDateTime>,
}

impl From<&BlobRow> for BlobEntry {
    fn from(row: &BlobRow) -> Self {
        Self {
            key: row.key.clone(),
            size: row.size_bytes(),
            mime: row.mime.clone(),
            updated_at: Some(row.updated_at),
        }
    }
}

/// What the caller promised when the upload started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedBlob {
    pub size: u64,
    pub mime: Option<String>,
}

/// Why a stored object was not accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompleteRejection {
    NotFound,
    SizeMismatch { expected: u64, actual: u64 },
    MimeMismatch { expected: String, actual: String },
    /// The bytes do not hash to the key. The object has been deleted.
    ChecksumMismatch,
}

impl CompleteRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::MimeMismatch { .. } => "mime_mismatch",
            Self::ChecksumMismatch => "checksum_mismatch",
        }
    }
}

/// Result of verifying a stored object against its key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed(ObjectMeta),
    Rejected(CompleteRejection),
}

impl CompleteOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Rejected(reason) => reason.as_str(),
        }
    }
}

/// How the client should send the bytes of a new blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadInit {
    /// The blob is already stored and verified.
    AlreadyUploaded,
    /// Upload parts of `part_size` bytes; `uploaded_parts` are already stored.
    Multipart {
        upload_id: String,
        part_size: u64,
        uploaded_parts: Vec<MultipartPart>,
        expires_at: OffsetDateTime,
    },
    /// PUT to the local proxy relay.
    Proxy(PresignedUpload),
    /// PUT directly to the backend.
    Presigned(PresignedUpload),
    /// The backend cannot accept client uploads; call [`BlobStore::put`].
    Direct,
}

/// Orchestrates blob records and objects for every workspace.
#[derive(Clone)]
pub struct BlobStore {
    storage: Arc<BackendHandle>,
    metadata: Arc<dyn MetadataStore>,
    events: BlobEvents,
}

impl BlobStore {
    /// Create a store and spawn its event worker on the current runtime.
    pub fn new(storage: Arc<BackendHandle>, metadata: Arc<dyn MetadataStore>) -> Self {
        let (store, rx) = Self::detached(storage, metadata);
        events::spawn_worker(store.clone(), rx);
        store
    }

    /// Create a store whose events are returned to the caller instead of handled.
    pub fn detached(
        storage: Arc<BackendHandle>,
        metadata: Arc<dyn MetadataStore>,
    ) -> (Self, mpsc::UnboundedReceiver<BlobEvent>) {
        let (events, rx) = BlobEvents::channel();
        (
            Self {
                storage,
                metadata,
                events,
            },
            rx,
        )
    }

    pub fn storage(&self) -> &Arc<BackendHandle> {
        &self.storage
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    async fn backend(&self) -> ApiResult<Arc<dyn StorageBackend>> {
        Ok(self.storage.get().await?)
    }

    // -------------------------------------------------------------------------
    // Single-blob operations
    // -------------------------------------------------------------------------

    /// Store bytes and record them as completed.
    #[instrument(skip(self, data), fields(workspace_id = %workspace_id, key = %key))]
    pub async fn put(
        &self,
        workspace_id: &str,
        key: &str,
        data: Bytes,
        mime: Option<&str>,
    ) -> ApiResult<()> {
        let mime = mime.unwrap_or(DEFAULT_MIME);
        let size = data.len() as u64;
        let backend = self.backend().await?;
        backend
            .put(
                &object_key(workspace_id, key),
                data,
                &PutMetadata::new(Some(mime.to_string()), Some(size)),
            )
            .await?;
        self.metadata
            .upsert_blob(&BlobUpsert::completed(workspace_id, key, size, mime))
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        workspace_id: &str,
        key: &str,
        signed_url: bool,
    ) -> ApiResult<GetObject> {
        let backend = self.backend().await?;
        Ok(backend
            .get(&object_key(workspace_id, key), signed_url)
            .await?)
    }

    pub async fn head(&self, workspace_id: &str, key: &str) -> ApiResult<Option<ObjectMeta>> {
        let backend = self.backend().await?;
        Ok(backend.head(&object_key(workspace_id, key)).await?)
    }

    // -------------------------------------------------------------------------
    // Capability pass-throughs
    // -------------------------------------------------------------------------

    pub async fn presign_put(
        &self,
        workspace_id: &str,
        key: &str,
        metadata: &PutMetadata,
    ) -> ApiResult<Support<PresignedUpload>> {
        let backend = self.backend().await?;
        match backend.presign_support() {
            Support::Supported(presign) => Ok(Support::Supported(
                presign
                    .presign_put(&object_key(workspace_id, key), metadata)
                    .await?,
            )),
            Support::Unsupported(capability) => Ok(Support::Unsupported(capability)),
        }
    }

    pub async fn create_multipart_upload(
        &self,
        workspace_id: &str,
        key: &str,
        metadata: &PutMetadata,
    ) -> ApiResult<Support<MultipartInit>> {
        let backend = self.backend().await?;
        match backend.multipart_support() {
            Support::Supported(multipart) => Ok(Support::Supported(
                multipart
                    .create_multipart_upload(&object_key(workspace_id, key), metadata)
                    .await?,
            )),
            Support::Unsupported(capability) => Ok(Support::Unsupported(capability)),
        }
    }

    pub async fn presign_upload_part(
        &self,
        workspace_id: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> ApiResult<Support<PresignedUpload>> {
        let backend = self.backend().await?;
        match backend.presign_support() {
            Support::Supported(presign) => Ok(Support::Supported(
                presign
                    .presign_upload_part(&object_key(workspace_id, key), upload_id, part_number)
                    .await?,
            )),
            Support::Unsupported(capability) => Ok(Support::Unsupported(capability)),
        }
    }

    pub async fn list_multipart_upload_parts(
        &self,
        workspace_id: &str,
        key: &str,
        upload_id: &str,
    ) -> ApiResult<Support<Option<Vec<MultipartPart>>>> {
        let backend = self.backend().await?;
        match backend.multipart_support() {
            Support::Supported(multipart) => Ok(Support::Supported(
                multipart
                    .list_multipart_upload_parts(&object_key(workspace_id, key), upload_id)
                    .await?,
            )),
            Support::Unsupported(capability) => Ok(Support::Unsupported(capability)),
        }
    }

    pub async fn complete_multipart_upload(
        &self,
        workspace_id: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<MultipartPart>,
    ) -> ApiResult<Support<()>> {
        let backend = self.backend().await?;
        match backend.multipart_support() {
            Support::Supported(multipart) => {
                multipart
                    .complete_multipart_upload(&object_key(workspace_id, key), upload_id, parts)
                    .await?;
                Ok(Support::Supported(()))
            }
            Support::Unsupported(capability) => Ok(Support::Unsupported(capability)),
        }
    }

    pub async fn abort_multipart_upload(
        &self,
        workspace_id: &str,
        key: &str,
        upload_id: &str,
    ) -> ApiResult<Support<()>> {
        let backend = self.backend().await?;
        match backend.multipart_support() {
            Support::Supported(multipart) => {
                multipart
                    .abort_multipart_upload(&object_key(workspace_id, key), upload_id)
                    .await?;
                Ok(Support::Supported(()))
            }
            Support::Unsupported(capability) => Ok(Support::Unsupported(capability)),
        }
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Verify the stored object against `expected` and its content hash.
    ///
    /// Size and mime mismatches leave the object in place. A checksum
    /// mismatch deletes it. On success the record becomes `completed`.
    #[instrument(skip(self, expected), fields(workspace_id = %workspace_id, key = %key))]
    pub async fn complete(
        &self,
        workspace_id: &str,
        key: &str,
        expected: &ExpectedBlob,
    ) -> ApiResult<CompleteOutcome> {
        let backend = self.backend().await?;
        let object = object_key(workspace_id, key);
        let outcome = verify_object(backend.as_ref(), &object, key, expected).await?;
        record_completion(outcome.label());

        match &outcome {
            CompleteOutcome::Completed(meta) => {
                let mime = meta
                    .content_type
                    .as_deref()
                    .or(expected.mime.as_deref())
                    .unwrap_or(DEFAULT_MIME);
                self.metadata
                    .upsert_blob(&BlobUpsert::completed(workspace_id, key, meta.size, mime))
                    .await?;
            }
            CompleteOutcome::Rejected(CompleteRejection::ChecksumMismatch) => {
                warn!("Stored bytes do not match the blob key, deleting object");
                if let Err(e) = backend.delete(&object).await {
                    warn!(error = %e, "Failed to delete mismatched object");
                }
            }
            CompleteOutcome::Rejected(reason) => {
                debug!(reason = reason.as_str(), "Blob completion rejected");
            }
        }

        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Listing
    // -------------------------------------------------------------------------

    /// Completed blobs of a workspace.
    ///
    /// A workspace with no records at all is listed from the backend, and a
    /// sync event is emitted for every object found.
    pub async fn list(&self, workspace_id: &str) -> ApiResult<Vec<BlobEntry>> {
        self.list_entries(workspace_id, true).await
    }

    async fn list_entries(&self, workspace_id: &str, sync: bool) -> ApiResult<Vec<BlobEntry>> {
        let rows = self.metadata.list_blobs(workspace_id).await?;
        if !rows.is_empty() {
            return Ok(rows.iter().map(BlobEntry::from).collect());
        }
        if self.metadata.has_blobs(workspace_id).await? {
            return Ok(Vec::new());
        }

        let backend = self.backend().await?;
        let prefix = workspace_prefix(workspace_id);
        let entries: Vec<BlobEntry> = backend
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|object| {
                let key = object.key.strip_prefix(&prefix)?;
                Some(BlobEntry {
                    key: key.to_string(),
                    size: object.size,
                    mime: DEFAULT_MIME.to_string(),
                    updated_at: object.last_modified,
                })
            })
            .collect();

        if sync {
            for entry in &entries {
                self.events.emit(BlobEvent::sync(workspace_id, &entry.key));
            }
        }
        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Deletion, release and accounting
    // -------------------------------------------------------------------------

    /// Delete a blob. A soft delete only marks the record.
    #[instrument(skip(self), fields(workspace_id = %workspace_id, key = %key))]
    pub async fn delete(&self, workspace_id: &str, key: &str, permanently: bool) -> ApiResult<()> {
        if permanently {
            let backend = self.backend().await?;
            backend.delete(&object_key(workspace_id, key)).await?;
            self.metadata.delete_blob(workspace_id, key).await?;
        } else {
            self.metadata
                .soft_delete_blob(workspace_id, key, OffsetDateTime::now_utc())
                .await?;
        }
        Ok(())
    }

    /// Schedule permanent deletion of every soft-deleted blob. Returns the count.
    pub async fn release(&self, workspace_id: &str) -> ApiResult<usize> {
        let rows = self.metadata.list_deleted_blobs(workspace_id).await?;
        for row in &rows {
            self.events.emit(BlobEvent::delete(workspace_id, &row.key));
        }
        Ok(rows.len())
    }

    /// Schedule deletion of every blob of a removed workspace. Returns the count.
    pub async fn on_workspace_deleted(&self, workspace_id: &str) -> ApiResult<usize> {
        let entries = self.list_entries(workspace_id, false).await?;
        for entry in &entries {
            self.events.emit(BlobEvent::delete(workspace_id, &entry.key));
        }
        Ok(entries.len())
    }

    /// Reconcile a record with storage. Errors are logged, never returned.
    pub async fn sync_blob_meta(&self, workspace_id: &str, key: &str) {
        if let Err(e) = self.try_sync_blob_meta(workspace_id, key).await {
            warn!(workspace_id = %workspace_id, key = %key, error = %e, "Failed to sync blob metadata");
        }
    }

    async fn try_sync_blob_meta(&self, workspace_id: &str, key: &str) -> ApiResult<()> {
        let backend = self.backend().await?;
        match backend.head(&object_key(workspace_id, key)).await? {
            Some(meta) => {
                let mime = meta.content_type.as_deref().unwrap_or(DEFAULT_MIME);
                self.metadata
                    .upsert_blob(&BlobUpsert::completed(workspace_id, key, meta.size, mime))
                    .await?;
            }
            None => {
                self.metadata.delete_blob(workspace_id, key).await?;
            }
        }
        Ok(())
    }

    /// Bytes held by completed, non-deleted blobs.
    pub async fn total_size(&self, workspace_id: &str) -> ApiResult<u64> {
        Ok(self.metadata.total_size(workspace_id).await?)
    }

    /// Handle one queued event. Failures only affect that blob.
    pub async fn handle_event(&self, event: BlobEvent) {
        match event {
            BlobEvent::Sync { workspace_id, key } => {
                self.sync_blob_meta(&workspace_id, &key).await;
            }
            BlobEvent::Delete { workspace_id, key } => {
                if let Err(e) = self.delete(&workspace_id, &key, true).await {
                    warn!(workspace_id = %workspace_id, key = %key, error = %e, "Failed to delete blob");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Upload initiation and completion
    // -------------------------------------------------------------------------

    /// Start (or resume) an upload and record it as pending.
    #[instrument(skip(self), fields(workspace_id = %workspace_id, key = %key))]
    pub async fn init_upload(
        &self,
        workspace_id: &str,
        key: &str,
        size: u64,
        mime: &str,
    ) -> ApiResult<UploadInit> {
        let existing = self.metadata.get_blob(workspace_id, key).await?;
        if let Some(row) = &existing
            && (row.size_bytes() != size || row.mime != mime)
        {
            return Err(ApiError::invalid("Blob size/mime mismatch"));
        }

        let backend = self.backend().await?;
        let object = object_key(workspace_id, key);

        if let Some(row) = &existing
            && row.is_completed()
            && backend.head(&object).await?.is_some()
        {
            return Ok(UploadInit::AlreadyUploaded);
        }

        let resume_id = existing.as_ref().and_then(|row| row.upload_id.as_deref());
        let metadata = PutMetadata::new(Some(mime.to_string()), Some(size));
        let (init, upload_id) =
            resolve_upload(backend.as_ref(), &object, resume_id, size, &metadata).await?;

        self.metadata
            .upsert_blob(&BlobUpsert::pending(
                workspace_id,
                key,
                size,
                mime,
                upload_id,
            ))
            .await?;
        Ok(init)
    }

    /// Finish an upload started with [`BlobStore::init_upload`].
    #[instrument(skip(self, parts), fields(workspace_id = %workspace_id, key = %key))]
    pub async fn complete_upload(
        &self,
        workspace_id: &str,
        key: &str,
        upload_id: Option<&str>,
        parts: Vec<MultipartPart>,
    ) -> ApiResult<BlobEntry> {
        let record = self
            .metadata
            .get_blob(workspace_id, key)
            .await?
            .ok_or_else(|| ApiError::invalid("Blob upload is not initialized"))?;
        if record.is_completed() {
            return Ok(BlobEntry::from(&record));
        }

        if let Some(record_upload_id) = record.upload_id.as_deref() {
            if upload_id != Some(record_upload_id) {
                return Err(ApiError::invalid("Upload id mismatch"));
            }
            if parts.is_empty() {
                return Err(ApiError::invalid("Multipart parts are required"));
            }
            let backend = self.backend().await?;
            let object = object_key(workspace_id, key);
            if backend.head(&object).await?.is_none() {
                backend
                    .multipart_support()
                    .require()?
                    .complete_multipart_upload(&object, record_upload_id, parts)
                    .await?;
            }
        }

        let expected = ExpectedBlob {
            size: record.size_bytes(),
            mime: Some(record.mime.clone()),
        };
        match self.complete(workspace_id, key, &expected).await? {
            CompleteOutcome::Completed(_) => self
                .metadata
                .get_blob(workspace_id, key)
                .await?
                .map(|row| BlobEntry::from(&row))
                .ok_or_else(|| ApiError::Internal("completed blob record vanished".to_string())),
            CompleteOutcome::Rejected(reason) => {
                if reason == CompleteRejection::ChecksumMismatch {
                    self.metadata.delete_blob(workspace_id, key).await?;
                }
                Err(ApiError::invalid(format!(
                    "Blob upload rejected: {}",
                    reason.as_str()
                )))
            }
        }
    }
}

/// Pick the upload strategy for a pending blob.
async fn resolve_upload(
    backend: &dyn StorageBackend,
    object: &str,
    resume_id: Option<&str>,
    size: u64,
    metadata: &PutMetadata,
) -> ApiResult<(UploadInit, Option<String>)> {
    if let Some(multipart) = backend.multipart() {
        if let Some(upload_id) = resume_id
            && let Some(uploaded_parts) = multipart
                .list_multipart_upload_parts(object, upload_id)
                .await?
        {
            let init = UploadInit::Multipart {
                upload_id: upload_id.to_string(),
                part_size: MULTIPART_PART_SIZE,
                uploaded_parts,
                expires_at: OffsetDateTime::now_utc()
                    + time::Duration::seconds(SIGNED_URL_EXPIRY_SECS as i64),
            };
            return Ok((init, Some(upload_id.to_string())));
        }

        if size >= MULTIPART_THRESHOLD {
            let created = multipart.create_multipart_upload(object, metadata).await?;
            let upload_id = created.upload_id.clone();
            let init = UploadInit::Multipart {
                upload_id: created.upload_id,
                part_size: MULTIPART_PART_SIZE,
                uploaded_parts: Vec::new(),
                expires_at: created.expires_at,
            };
            return Ok((init, Some(upload_id)));
        }
    }

    if let Some(presign) = backend.presign() {
        let presigned = presign.presign_put(object, metadata).await?;
        let init = if presigned.is_proxy_relay() {
            UploadInit::Proxy(presigned)
        } else {
            UploadInit::Presigned(presigned)
        };
        return Ok((init, None));
    }

    Ok((UploadInit::Direct, None))
}

/// Head, compare, then hash the stored object.
async fn verify_object(
    backend: &dyn StorageBackend,
    object: &str,
    key: &str,
    expected: &ExpectedBlob,
) -> ApiResult<CompleteOutcome> {
    let Some(meta) = backend.head(object).await? else {
        return Ok(CompleteOutcome::Rejected(CompleteRejection::NotFound));
    };

    if meta.size != expected.size {
        return Ok(CompleteOutcome::Rejected(CompleteRejection::SizeMismatch {
            expected: expected.size,
            actual: meta.size,
        }));
    }

    if let (Some(expected_mime), Some(actual)) =
        (expected.mime.as_deref(), meta.content_type.as_deref())
        && expected_mime != actual
    {
        return Ok(CompleteOutcome::Rejected(CompleteRejection::MimeMismatch {
            expected: expected_mime.to_string(),
            actual: actual.to_string(),
        }));
    }

    let stream = match backend.get(object, false).await? {
        GetObject::Body { stream, .. } => stream,
        GetObject::NotFound => {
            return Ok(CompleteOutcome::Rejected(CompleteRejection::NotFound));
        }
        GetObject::Redirect { .. } => {
            return Err(ApiError::Internal(
                "backend redirected an unsigned read".to_string(),
            ));
        }
    };

    match hash_stream(stream).await {
        Ok(hash) if hash.matches_key(key) => Ok(CompleteOutcome::Completed(meta)),
        Ok(hash) => {
            debug!(actual = %hash, "Content hash differs from key");
            Ok(CompleteOutcome::Rejected(CompleteRejection::ChecksumMismatch))
        }
        Err(e) => {
            warn!(error = %e, "Failed to read object while hashing");
            Ok(CompleteOutcome::Rejected(CompleteRejection::ChecksumMismatch))
        }
    }
}

async fn hash_stream(mut stream: ByteStream) -> StorageResult<ContentHash> {
    let mut hasher = ContentHash::hasher();
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finalize())
}
