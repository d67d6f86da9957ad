//! Storage test utilities.
//!
//! [`RecordingBackend`] is an in-memory backend that records every I/O call,
//! so tests can assert exactly what reached storage.

use async_trait::async_trait;
use bytes::Bytes;
use cask_core::config::{ProxyUploadConfig, StorageConfig};
use cask_storage::{
    BackendHandle, ByteStream, GetObject, ListedObject, MultipartCapability, MultipartInit,
    MultipartPart, ObjectMeta, PresignCapability, PresignedUpload, ProxyBackend, PutMetadata,
    StorageBackend, StorageError, StorageResult, bytes_stream, collect_stream,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

/// Sign key used by every proxy-mode test backend.
#[allow(dead_code)]
pub const TEST_SIGN_KEY: &str = "test-proxy-sign-key";

/// A storage call observed by [`RecordingBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Call {
    Put,
    PutStream,
    Head,
    Get,
    List,
    Delete,
    PresignPut,
    PresignPart,
    CreateMultipart,
    UploadPart,
    ListParts,
    CompleteMultipart,
    AbortMultipart,
}

struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    last_modified: OffsetDateTime,
}

struct OpenUpload {
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<i32, (Bytes, String)>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, OpenUpload>,
    calls: Vec<Call>,
    failing_deletes: HashSet<String>,
    failing_aborts: HashSet<String>,
    next_upload: u64,
}

/// In-memory backend that records calls.
#[allow(dead_code)]
pub struct RecordingBackend {
    state: Mutex<State>,
    presign: bool,
    multipart: bool,
}

#[allow(dead_code)]
impl RecordingBackend {
    /// A backend with presign and multipart support.
    pub fn new() -> Self {
        Self::with_capabilities(true, true)
    }

    /// A backend with neither presign nor multipart, like the filesystem.
    pub fn plain() -> Self {
        Self::with_capabilities(false, false)
    }

    pub fn with_capabilities(presign: bool, multipart: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            presign,
            multipart,
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Store an object without recording a call.
    pub fn insert_object(&self, key: &str, data: impl Into<Bytes>, content_type: Option<&str>) {
        self.state.lock().unwrap().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: content_type.map(str::to_string),
                last_modified: OffsetDateTime::now_utc(),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.data.clone())
    }

    pub fn object_content_type(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .and_then(|o| o.content_type.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Make every delete of `key` fail.
    pub fn fail_delete(&self, key: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deletes
            .insert(key.to_string());
    }

    /// Make every abort of `upload_id` fail with a transient error.
    pub fn fail_abort(&self, upload_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_aborts
            .insert(upload_id.to_string());
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    fn store(&self, key: &str, data: Bytes, metadata: &PutMetadata) {
        self.insert_object(key, data, metadata.content_type.as_deref());
    }

    fn relay(&self, url: String) -> PresignedUpload {
        PresignedUpload {
            url,
            headers: BTreeMap::new(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
        }
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    async fn put(&self, key: &str, data: Bytes, metadata: &PutMetadata) -> StorageResult<()> {
        self.record(Call::Put);
        self.store(key, data, metadata);
        Ok(())
    }

    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        metadata: &PutMetadata,
    ) -> StorageResult<()> {
        self.record(Call::PutStream);
        let data = collect_stream(body).await?;
        self.store(key, data, metadata);
        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        self.record(Call::Head);
        let state = self.state.lock().unwrap();
        Ok(state.objects.get(key).map(|o| ObjectMeta {
            size: o.data.len() as u64,
            content_type: o.content_type.clone(),
            last_modified: Some(o.last_modified),
        }))
    }

    async fn get(&self, key: &str, _signed_url: bool) -> StorageResult<GetObject> {
        self.record(Call::Get);
        let state = self.state.lock().unwrap();
        Ok(match state.objects.get(key) {
            Some(o) => GetObject::Body {
                meta: ObjectMeta {
                    size: o.data.len() as u64,
                    content_type: o.content_type.clone(),
                    last_modified: Some(o.last_modified),
                },
                stream: bytes_stream(o.data.clone()),
            },
            None => GetObject::NotFound,
        })
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ListedObject>> {
        self.record(Call::List);
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| ListedObject {
                key: key.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.record(Call::Delete);
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(key) {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "injected delete failure for {key}"
            ))));
        }
        state.objects.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }

    fn presign(&self) -> Option<&dyn PresignCapability> {
        if self.presign { Some(self) } else { None }
    }

    fn multipart(&self) -> Option<&dyn MultipartCapability> {
        if self.multipart { Some(self) } else { None }
    }
}

#[async_trait]
impl PresignCapability for RecordingBackend {
    async fn presign_put(
        &self,
        key: &str,
        _metadata: &PutMetadata,
    ) -> StorageResult<PresignedUpload> {
        self.record(Call::PresignPut);
        Ok(self.relay(format!("https://storage.test/{key}?X-Amz-Signature=test")))
    }

    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> StorageResult<PresignedUpload> {
        self.record(Call::PresignPart);
        Ok(self.relay(format!(
            "https://storage.test/{key}?uploadId={upload_id}&partNumber={part_number}"
        )))
    }
}

#[async_trait]
impl MultipartCapability for RecordingBackend {
    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &PutMetadata,
    ) -> StorageResult<MultipartInit> {
        self.record(Call::CreateMultipart);
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                key: key.to_string(),
                content_type: metadata.content_type.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartInit {
            upload_id,
            expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ByteStream,
        _content_length: u64,
    ) -> StorageResult<String> {
        self.record(Call::UploadPart);
        let data = collect_stream(body).await?;
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;
        let etag = format!("\"etag-{part_number}-{}\"", data.len());
        upload.parts.insert(part_number, (data, etag.clone()));
        Ok(etag)
    }

    async fn list_multipart_upload_parts(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> StorageResult<Option<Vec<MultipartPart>>> {
        self.record(Call::ListParts);
        let state = self.state.lock().unwrap();
        Ok(state.uploads.get(upload_id).map(|upload| {
            upload
                .parts
                .iter()
                .map(|(part_number, (_, etag))| MultipartPart {
                    part_number: *part_number,
                    etag: etag.clone(),
                })
                .collect()
        }))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<MultipartPart>,
    ) -> StorageResult<()> {
        self.record(Call::CompleteMultipart);
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;

        let mut parts = parts;
        parts.sort_by_key(|p| p.part_number);
        let mut data = Vec::new();
        for part in &parts {
            let (bytes, etag) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StorageError::NotFound(format!("part {}", part.part_number)))?;
            if *etag != part.etag {
                return Err(StorageError::InvalidKey(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            data.extend_from_slice(bytes);
        }

        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                content_type: upload.content_type,
                last_modified: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> StorageResult<()> {
        self.record(Call::AbortMultipart);
        let mut state = self.state.lock().unwrap();
        if state.failing_aborts.contains(upload_id) {
            return Err(StorageError::Io(std::io::Error::other("abort unavailable")));
        }
        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))
    }
}

/// Proxy settings as an R2 deployment would carry them.
#[allow(dead_code)]
pub fn proxy_config(enabled: bool) -> ProxyUploadConfig {
    ProxyUploadConfig {
        enabled,
        url_prefix: None,
        sign_key: Some(TEST_SIGN_KEY.to_string()),
    }
}

/// An R2 storage config with the given proxy settings.
#[allow(dead_code)]
pub fn r2_config(proxy_upload: Option<ProxyUploadConfig>) -> StorageConfig {
    StorageConfig::R2 {
        account_id: "test-account".to_string(),
        bucket: "blobs".to_string(),
        prefix: None,
        access_key_id: "test-access".to_string(),
        secret_access_key: "test-secret".to_string(),
        presigned_get: false,
        request_timeout_secs: 60,
        connect_timeout_secs: 10,
        proxy_upload,
    }
}

/// A handle serving `recorder` directly.
#[allow(dead_code)]
pub fn recording_handle(recorder: &Arc<RecordingBackend>) -> Arc<BackendHandle> {
    Arc::new(BackendHandle::from_backend(r2_config(None), recorder.clone()))
}

/// A handle serving `recorder` behind a [`ProxyBackend`].
#[allow(dead_code)]
pub fn proxied_handle(recorder: &Arc<RecordingBackend>, enabled: bool) -> Arc<BackendHandle> {
    let config = proxy_config(enabled);
    let backend = ProxyBackend::new(recorder.clone(), &config).expect("proxy backend");
    Arc::new(BackendHandle::from_backend(
        r2_config(Some(config)),
        Arc::new(backend),
    ))
}
