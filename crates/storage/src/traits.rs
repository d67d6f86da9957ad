//! Storage trait definitions.
//!
//! Every backend implements [`StorageBackend`]. Presigned uploads, multipart
//! uploads and proxy relaying are optional and exposed as capability queries
//! rather than as methods that may or may not work.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use time::OffsetDateTime;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Metadata supplied with a write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutMetadata {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

impl PutMetadata {
    pub fn new(content_type: Option<String>, content_length: Option<u64>) -> Self {
        Self {
            content_type,
            content_length,
        }
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Content type (if available).
    pub content_type: Option<String>,
    /// Last modification time (if available).
    pub last_modified: Option<OffsetDateTime>,
}

/// A single entry returned by [`StorageBackend::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedObject {
    /// Key relative to the backend root.
    pub key: String,
    pub size: u64,
    pub last_modified: Option<OffsetDateTime>,
}

/// A time-limited URL a client may PUT bytes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresignedUpload {
    /// Absolute backend URL, or a relative path to the local proxy relay.
    pub url: String,
    /// Headers the client must send with the PUT.
    pub headers: BTreeMap<String, String>,
    pub expires_at: OffsetDateTime,
}

impl PresignedUpload {
    /// Whether the URL points at the local proxy relay rather than the backend.
    pub fn is_proxy_relay(&self) -> bool {
        self.url.starts_with('/')
    }
}

/// A newly created multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartInit {
    pub upload_id: String,
    pub expires_at: OffsetDateTime,
}

/// A part already stored for a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    pub part_number: i32,
    pub etag: String,
}

/// Result of a read.
pub enum GetObject {
    /// The object bytes, streamed.
    Body { meta: ObjectMeta, stream: ByteStream },
    /// The caller should fetch the object from this URL instead.
    Redirect { url: String },
    NotFound,
}

impl fmt::Debug for GetObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body { meta, .. } => f
                .debug_struct("Body")
                .field("meta", meta)
                .finish_non_exhaustive(),
            Self::Redirect { url } => f.debug_struct("Redirect").field("url", url).finish(),
            Self::NotFound => f.write_str("NotFound"),
        }
    }
}

/// An optional backend capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Presigned PUT URLs for objects and multipart parts.
    PresignPut,
    /// Server-side multipart uploads.
    Multipart,
    /// Relaying client uploads through the local proxy endpoint.
    ProxyUpload,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Self::PresignPut, Self::Multipart, Self::ProxyUpload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PresignPut => "presign_put",
            Self::Multipart => "multipart",
            Self::ProxyUpload => "proxy_upload",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of capabilities a backend offers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    presign_put: bool,
    multipart: bool,
    proxy_upload: bool,
}

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: Capability) -> Self {
        match capability {
            Capability::PresignPut => self.presign_put = true,
            Capability::Multipart => self.multipart = true,
            Capability::ProxyUpload => self.proxy_upload = true,
        }
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        match capability {
            Capability::PresignPut => self.presign_put,
            Capability::Multipart => self.multipart,
            Capability::ProxyUpload => self.proxy_upload,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.presign_put || self.multipart || self.proxy_upload)
    }

    /// Capabilities present, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

/// Outcome of reaching for an optional capability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Support<T> {
    Supported(T),
    Unsupported(Capability),
}

impl<T> Support<T> {
    /// Wrap the result of a capability query.
    pub fn from_option(value: Option<T>, capability: Capability) -> Self {
        match value {
            Some(v) => Self::Supported(v),
            None => Self::Unsupported(capability),
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Support<U> {
        match self {
            Self::Supported(v) => Support::Supported(f(v)),
            Self::Unsupported(c) => Support::Unsupported(c),
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Supported(v) => Some(v),
            Self::Unsupported(_) => None,
        }
    }

    /// Convert an unsupported capability into [`StorageError::Unsupported`].
    pub fn require(self) -> StorageResult<T> {
        match self {
            Self::Supported(v) => Ok(v),
            Self::Unsupported(capability) => Err(StorageError::Unsupported { capability }),
        }
    }
}

/// Presigned PUT URLs.
#[async_trait]
pub trait PresignCapability: Send + Sync {
    /// Presign a single-object PUT.
    async fn presign_put(
        &self,
        key: &str,
        metadata: &PutMetadata,
    ) -> StorageResult<PresignedUpload>;

    /// Presign the PUT of one multipart part.
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> StorageResult<PresignedUpload>;
}

/// Server-side multipart uploads.
#[async_trait]
pub trait MultipartCapability: Send + Sync {
    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &PutMetadata,
    ) -> StorageResult<MultipartInit>;

    /// Upload one part and return its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ByteStream,
        content_length: u64,
    ) -> StorageResult<String>;

    /// Parts stored so far, or `None` when the upload no longer exists.
    async fn list_multipart_upload_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<Option<Vec<MultipartPart>>>;

    /// Commit the upload. Parts may be given in any order.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<MultipartPart>,
    ) -> StorageResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;
}

/// Writes relayed by the local proxy endpoint using the backend's own credentials.
#[async_trait]
pub trait ProxyUploadCapability: Send + Sync {
    /// Check a relay token against the route path, the signed fields in
    /// order, and the expiry it claims.
    fn verify_upload_token(
        &self,
        path: &str,
        fields: &[Option<&str>],
        exp: i64,
        token: &str,
    ) -> bool;

    async fn proxy_put_object(
        &self,
        key: &str,
        body: ByteStream,
        metadata: &PutMetadata,
    ) -> StorageResult<()>;

    /// Relay one multipart part and return its ETag.
    async fn proxy_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ByteStream,
        content_length: u64,
    ) -> StorageResult<String>;
}

/// Object storage abstraction for workspace blobs.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Write an object, replacing any existing one.
    async fn put(&self, key: &str, data: Bytes, metadata: &PutMetadata) -> StorageResult<()>;

    /// Write an object from a stream without buffering it.
    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        metadata: &PutMetadata,
    ) -> StorageResult<()>;

    /// Object metadata, or `None` if absent.
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Read an object. With `signed_url`, a backend may answer with a redirect.
    async fn get(&self, key: &str, signed_url: bool) -> StorageResult<GetObject>;

    /// List every object under `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ListedObject>>;

    /// Delete an object. Missing objects are not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Static identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup to ensure the storage is reachable before
    /// accepting requests. The default implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    fn presign(&self) -> Option<&dyn PresignCapability> {
        None
    }

    fn multipart(&self) -> Option<&dyn MultipartCapability> {
        None
    }

    fn proxy_upload(&self) -> Option<&dyn ProxyUploadCapability> {
        None
    }

    /// Capabilities derived from the three queries above.
    fn capabilities(&self) -> CapabilitySet {
        let mut set = CapabilitySet::empty();
        if self.presign().is_some() {
            set = set.with(Capability::PresignPut);
        }
        if self.multipart().is_some() {
            set = set.with(Capability::Multipart);
        }
        if self.proxy_upload().is_some() {
            set = set.with(Capability::ProxyUpload);
        }
        set
    }
}

/// Typed accessors that wrap capability queries in [`Support`].
pub trait StorageBackendExt: StorageBackend {
    fn presign_support(&self) -> Support<&dyn PresignCapability> {
        Support::from_option(self.presign(), Capability::PresignPut)
    }

    fn multipart_support(&self) -> Support<&dyn MultipartCapability> {
        Support::from_option(self.multipart(), Capability::Multipart)
    }

    fn proxy_upload_support(&self) -> Support<&dyn ProxyUploadCapability> {
        Support::from_option(self.proxy_upload(), Capability::ProxyUpload)
    }
}

impl<T: StorageBackend + ?Sized> StorageBackendExt for T {}

/// Collect a byte stream into a single buffer.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    use futures::StreamExt;

    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// A single-chunk stream over in-memory bytes.
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_iteration_order() {
        let set = CapabilitySet::empty()
            .with(Capability::ProxyUpload)
            .with(Capability::PresignPut);
        let caps: Vec<_> = set.iter().collect();
        assert_eq!(caps, vec![Capability::PresignPut, Capability::ProxyUpload]);
        assert!(!set.contains(Capability::Multipart));
        assert!(CapabilitySet::empty().is_empty());
    }

    #[test]
    fn test_support_require() {
        let supported: Support<u32> = Support::from_option(Some(1), Capability::Multipart);
        assert_eq!(supported.require().unwrap(), 1);

        let unsupported: Support<u32> = Support::from_option(None, Capability::Multipart);
        match unsupported.require() {
            Err(StorageError::Unsupported { capability }) => {
                assert_eq!(capability, Capability::Multipart)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_proxy_relay_detection() {
        let upload = PresignedUpload {
            url: "/api/storage/upload?token=x".to_string(),
            headers: BTreeMap::new(),
            expires_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(upload.is_proxy_relay());

        let native = PresignedUpload {
            url: "https://bucket.s3.amazonaws.com/ws/key".to_string(),
            ..upload
        };
        assert!(!native.is_proxy_relay());
    }

    #[tokio::test]
    async fn test_collect_stream() {
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"r2-")),
            Ok(Bytes::from_static(b"proxy")),
        ]));
        assert_eq!(collect_stream(stream).await.unwrap(), "r2-proxy");
    }
}
