//! Proxy-capable decorator over any storage backend.
//!
//! Some backends cannot safely hand browsers presigned URLs (CORS, private
//! endpoints). In proxy mode the decorator answers presign requests with a
//! relative URL to the local upload relay instead. The URL carries an HMAC
//! token binding the route, every request field and an expiry, and the relay
//! writes the body through the wrapped backend's own credentials.
//!
//! Independently, when a CDN origin is configured, signed reads redirect to
//! `url_prefix/key?sign=...`.

use crate::error::StorageResult;
use crate::traits::{
    ByteStream, GetObject, ListedObject, MultipartCapability, ObjectMeta, PresignCapability,
    PresignedUpload, ProxyUploadCapability, PutMetadata, StorageBackend, StorageBackendExt,
};
use async_trait::async_trait;
use bytes::Bytes;
use cask_core::config::ProxyUploadConfig;
use cask_core::{
    DEFAULT_MIME, PROXY_MULTIPART_PATH, PROXY_UPLOAD_PATH, SIGNED_URL_EXPIRY_SECS, WorkspaceKey,
};
use cask_signer::CapabilitySigner;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// Characters escaped in query values (everything but RFC 3986 unreserved).
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

/// Storage backend decorator adding proxy uploads and CDN-signed reads.
pub struct ProxyBackend {
    inner: Arc<dyn StorageBackend>,
    signer: Option<CapabilitySigner>,
    proxy_mode: bool,
    url_prefix: Option<String>,
}

impl std::fmt::Debug for ProxyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBackend")
            .field("inner", &self.inner.backend_name())
            .field("proxy_mode", &self.proxy_mode)
            .field("url_prefix", &self.url_prefix)
            .finish_non_exhaustive()
    }
}

impl ProxyBackend {
    /// Wrap `inner` according to `config`.
    pub fn new(inner: Arc<dyn StorageBackend>, config: &ProxyUploadConfig) -> StorageResult<Self> {
        let signer = match config.sign_key.as_deref() {
            Some(key) if !key.is_empty() => Some(CapabilitySigner::from_secret(key)?),
            _ => None,
        };
        let url_prefix = config
            .url_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| p.trim_end_matches('/').to_string());

        Ok(Self {
            proxy_mode: config.enabled && signer.is_some(),
            inner,
            signer,
            url_prefix,
        })
    }

    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    /// Whether presigns are answered with relay URLs.
    pub fn is_proxy_mode(&self) -> bool {
        self.proxy_mode
    }

    fn proxy_signer(&self) -> Option<&CapabilitySigner> {
        if self.proxy_mode {
            self.signer.as_ref()
        } else {
            None
        }
    }

    /// Build a relay URL: every present field, then `exp` and `token`.
    fn relay_url(
        signer: &CapabilitySigner,
        path: &str,
        fields: &[(&str, Option<&str>)],
    ) -> (String, OffsetDateTime) {
        let expires_at = OffsetDateTime::now_utc()
            + time::Duration::seconds(SIGNED_URL_EXPIRY_SECS as i64);
        let exp = expires_at.unix_timestamp();

        let values: Vec<Option<&str>> = fields.iter().map(|(_, v)| *v).collect();
        let token = signer.sign_token(path, &values, exp);

        let mut query: Vec<String> = fields
            .iter()
            .filter_map(|(name, value)| value.map(|v| format!("{name}={}", encode(v))))
            .collect();
        query.push(format!("exp={exp}"));
        query.push(format!("token={}", encode(&token)));

        (format!("{path}?{}", query.join("&")), expires_at)
    }

    fn native_presign(&self) -> StorageResult<&dyn PresignCapability> {
        self.inner.presign_support().require()
    }
}

#[async_trait]
impl StorageBackend for ProxyBackend {
    async fn put(&self, key: &str, data: Bytes, metadata: &PutMetadata) -> StorageResult<()> {
        self.inner.put(key, data, metadata).await
    }

    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        metadata: &PutMetadata,
    ) -> StorageResult<()> {
        self.inner.put_stream(key, body, metadata).await
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        self.inner.head(key).await
    }

    #[instrument(skip(self), fields(backend = "proxy"))]
    async fn get(&self, key: &str, signed_url: bool) -> StorageResult<GetObject> {
        if signed_url
            && let (Some(prefix), Some(signer)) = (&self.url_prefix, &self.signer)
        {
            if self.inner.head(key).await?.is_none() {
                return Ok(GetObject::NotFound);
            }
            let pathname = format!("/{key}");
            let sign = signer.sign_cdn_path(&pathname, OffsetDateTime::now_utc().unix_timestamp());
            return Ok(GetObject::Redirect {
                url: format!("{prefix}{pathname}?sign={}", encode(&sign)),
            });
        }

        self.inner.get(key, signed_url).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ListedObject>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }

    fn presign(&self) -> Option<&dyn PresignCapability> {
        if self.proxy_mode || self.inner.presign().is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn multipart(&self) -> Option<&dyn MultipartCapability> {
        self.inner.multipart()
    }

    fn proxy_upload(&self) -> Option<&dyn ProxyUploadCapability> {
        if self.proxy_mode { Some(self) } else { None }
    }
}

#[async_trait]
impl PresignCapability for ProxyBackend {
    #[instrument(skip(self, metadata), fields(backend = "proxy"))]
    async fn presign_put(
        &self,
        key: &str,
        metadata: &PutMetadata,
    ) -> StorageResult<PresignedUpload> {
        let (Some(signer), Some(parsed)) = (self.proxy_signer(), WorkspaceKey::parse(key)) else {
            return self.native_presign()?.presign_put(key, metadata).await;
        };

        let content_type = metadata.content_type.as_deref().unwrap_or(DEFAULT_MIME);
        let content_length = metadata.content_length.map(|l| l.to_string());
        let (url, expires_at) = Self::relay_url(
            signer,
            PROXY_UPLOAD_PATH,
            &[
                ("workspaceId", Some(parsed.workspace_id)),
                ("key", Some(parsed.key)),
                ("contentType", Some(content_type)),
                ("contentLength", content_length.as_deref()),
            ],
        );

        Ok(PresignedUpload {
            url,
            headers: BTreeMap::from([("Content-Type".to_string(), content_type.to_string())]),
            expires_at,
        })
    }

    #[instrument(skip(self), fields(backend = "proxy"))]
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> StorageResult<PresignedUpload> {
        let (Some(signer), Some(parsed)) = (self.proxy_signer(), WorkspaceKey::parse(key)) else {
            return self
                .native_presign()?
                .presign_upload_part(key, upload_id, part_number)
                .await;
        };

        let part_number = part_number.to_string();
        let (url, expires_at) = Self::relay_url(
            signer,
            PROXY_MULTIPART_PATH,
            &[
                ("workspaceId", Some(parsed.workspace_id)),
                ("key", Some(parsed.key)),
                ("uploadId", Some(upload_id)),
                ("partNumber", Some(part_number.as_str())),
            ],
        );

        Ok(PresignedUpload {
            url,
            headers: BTreeMap::new(),
            expires_at,
        })
    }
}

#[async_trait]
impl ProxyUploadCapability for ProxyBackend {
    fn verify_upload_token(
        &self,
        path: &str,
        fields: &[Option<&str>],
        exp: i64,
        token: &str,
    ) -> bool {
        self.proxy_signer()
            .is_some_and(|signer| signer.verify_token(path, fields, exp, token).is_ok())
    }

    #[instrument(skip(self, body, metadata), fields(backend = "proxy"))]
    async fn proxy_put_object(
        &self,
        key: &str,
        body: ByteStream,
        metadata: &PutMetadata,
    ) -> StorageResult<()> {
        self.inner.put_stream(key, body, metadata).await
    }

    #[instrument(skip(self, body), fields(backend = "proxy"))]
    async fn proxy_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ByteStream,
        content_length: u64,
    ) -> StorageResult<String> {
        let multipart = self.inner.multipart_support().require()?;
        multipart
            .upload_part(key, upload_id, part_number, body, content_length)
            .await
    }
}
