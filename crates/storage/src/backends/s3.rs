//! S3-compatible storage backend using AWS SDK.
//!
//! Works against AWS S3, MinIO and Cloudflare R2. Offers presigned PUTs and
//! multipart uploads natively.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, GetObject, ListedObject, MultipartCapability, MultipartInit, MultipartPart,
    ObjectMeta, PresignCapability, PresignedUpload, PutMetadata, StorageBackend, collect_stream,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::{PresignedRequest, PresigningConfig};
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use aws_smithy_types::timeout::TimeoutConfig;
use bytes::Bytes;
use cask_core::SIGNED_URL_EXPIRY_SECS;
use futures::Stream;
use http_body::{Frame, SizeHint};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Marker included in lazy-credentials initialization errors so we can map them
/// to actionable storage config errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "cask-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "cask-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root initialization)
/// in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|join_err| {
                    CredentialsError::provider_error(format!(
                        "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
                    ))
                })
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

fn sdk_length(length: u64) -> StorageResult<i64> {
    i64::try_from(length).map_err(|_| {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("content length {length} out of range"),
        ))
    })
}

/// Whether an SDK error is the service reporting that the target does not exist.
fn is_not_found<E: ProvideErrorMetadata>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => {
            service_err.raw().status().as_u16() == 404
                || matches!(
                    service_err.err().code(),
                    Some("NoSuchKey" | "NotFound" | "NoSuchUpload")
                )
        }
        _ => false,
    }
}

fn to_offset_date_time(dt: &aws_smithy_types::DateTime) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(dt.secs()).ok()
}

fn presign_config() -> StorageResult<PresigningConfig> {
    PresigningConfig::expires_in(Duration::from_secs(SIGNED_URL_EXPIRY_SECS))
        .map_err(|e| StorageError::Config(format!("invalid presigning config: {e}")))
}

fn presigned_upload(request: PresignedRequest) -> PresignedUpload {
    let headers = request
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect::<BTreeMap<_, _>>();
    PresignedUpload {
        url: request.uri().to_string(),
        headers,
        expires_at: OffsetDateTime::now_utc()
            + time::Duration::seconds(SIGNED_URL_EXPIRY_SECS as i64),
    }
}

/// Order parts by part number for commit.
fn sorted_completed_parts(mut parts: Vec<MultipartPart>) -> Vec<CompletedPart> {
    parts.sort_by_key(|p| p.part_number);
    parts
        .into_iter()
        .map(|p| {
            CompletedPart::builder()
                .part_number(p.part_number)
                .e_tag(p.etag)
                .build()
        })
        .collect()
}

/// `http_body::Body` over a [`ByteStream`] so request bodies stream into the SDK.
///
/// The SDK requires `Sync` bodies; the stream only ever sees `&mut` access, so
/// the mutex is never contended.
struct StreamBody {
    stream: Mutex<ByteStream>,
    len: u64,
}

impl http_body::Body for StreamBody {
    type Data = Bytes;
    type Error = StorageError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, StorageError>>> {
        let stream = self
            .get_mut()
            .stream
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        stream
            .as_mut()
            .poll_next(cx)
            .map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.len)
    }
}

fn streaming_body(stream: ByteStream, len: u64) -> S3ByteStream {
    S3ByteStream::from_body_1_x(StreamBody {
        stream: Mutex::new(stream),
        len,
    })
}

/// Connection settings for [`S3Backend`].
#[derive(Clone, Debug)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Use path-style URLs (`endpoint/bucket/key`) instead of virtual-hosted
    /// style (`bucket.endpoint/key`). Required for MinIO and R2.
    pub force_path_style: bool,
    /// Answer signed GETs with a presigned redirect.
    pub presigned_get: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl S3Settings {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            presigned_get: false,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Settings for a Cloudflare R2 bucket.
    pub fn r2(
        account_id: &str,
        bucket: impl Into<String>,
        access_key_id: String,
        secret_access_key: String,
    ) -> Self {
        Self {
            endpoint: Some(format!("https://{account_id}.r2.cloudflarestorage.com")),
            region: Some("auto".to_string()),
            access_key_id: Some(access_key_id),
            secret_access_key: Some(secret_access_key),
            force_path_style: true,
            ..Self::new(bucket)
        }
    }
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
    region: String,
    presigned_get: bool,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("presigned_get", &self.presigned_get)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    pub async fn new(settings: S3Settings) -> StorageResult<Self> {
        let S3Settings {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
            presigned_get,
            request_timeout,
            connect_timeout,
        } = settings;

        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(connect_timeout)
            .operation_timeout(request_timeout)
            .build();

        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()))
            .timeout_config(timeouts);

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "cask-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        // Bare host:port endpoints (e.g., "minio:9000") default to http
        let normalized_endpoint = endpoint.map(|endpoint_url| {
            let lower = endpoint_url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain-HTTP endpoints get an HTTP-only client so SDK
            // initialization does not depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket,
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            endpoint: normalized_endpoint
                .unwrap_or_else(|| format!("s3.{resolved_region}.amazonaws.com")),
            region: resolved_region,
            presigned_get,
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }

    async fn put_body(
        &self,
        key: &str,
        body: S3ByteStream,
        metadata: &PutMetadata,
    ) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(body)
            .set_content_type(metadata.content_type.clone())
            .set_content_length(metadata.content_length.map(sdk_length).transpose()?)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    async fn presigned_get_url(&self, key: &str) -> StorageResult<String> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .presigned(presign_config()?)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(request.uri().to_string())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[instrument(skip(self, data, metadata), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, metadata: &PutMetadata) -> StorageResult<()> {
        let metadata = PutMetadata {
            content_length: Some(data.len() as u64),
            ..metadata.clone()
        };
        self.put_body(key, data.into(), &metadata).await
    }

    #[instrument(skip(self, body, metadata), fields(backend = "s3"))]
    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        metadata: &PutMetadata,
    ) -> StorageResult<()> {
        match metadata.content_length {
            Some(len) => self.put_body(key, streaming_body(body, len), metadata).await,
            None => {
                // PutObject needs a length up front
                let data = collect_stream(body).await?;
                self.put(key, data, metadata).await
            }
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                content_type: output.content_type().map(str::to_string),
                last_modified: output.last_modified().and_then(to_offset_date_time),
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str, signed_url: bool) -> StorageResult<GetObject> {
        if signed_url && self.presigned_get {
            if self.head(key).await?.is_none() {
                return Ok(GetObject::NotFound);
            }
            let url = self.presigned_get_url(key).await?;
            return Ok(GetObject::Redirect { url });
        }

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(GetObject::NotFound),
            Err(err) => return Err(map_s3_operation_error(err)),
        };

        let meta = ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_string),
            last_modified: output.last_modified().and_then(to_offset_date_time),
        };

        use futures::StreamExt;
        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));

        Ok(GetObject::Body {
            meta,
            stream: Box::pin(stream),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ListedObject>> {
        let full_prefix = self.full_key(prefix);
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            for obj in output.contents() {
                if let Some(obj_key) = obj.key() {
                    results.push(ListedObject {
                        key: self.strip_prefix(obj_key),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        last_modified: obj.last_modified().and_then(to_offset_date_time),
                    });
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated() == Some(true) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        tracing::debug!(prefix = %prefix, count = results.len(), "Listed objects");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let marker_key = self.full_key(".cask-health-check");
        let check = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(err) if is_not_found(&err) => Ok(()),
                Err(err) => Err(map_s3_operation_error(err)),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }

    fn presign(&self) -> Option<&dyn PresignCapability> {
        Some(self)
    }

    fn multipart(&self) -> Option<&dyn MultipartCapability> {
        Some(self)
    }
}

#[async_trait]
impl PresignCapability for S3Backend {
    #[instrument(skip(self, metadata), fields(backend = "s3"))]
    async fn presign_put(
        &self,
        key: &str,
        metadata: &PutMetadata,
    ) -> StorageResult<PresignedUpload> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_content_type(metadata.content_type.clone())
            .presigned(presign_config()?)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(presigned_upload(request))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> StorageResult<PresignedUpload> {
        let request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presign_config()?)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(presigned_upload(request))
    }
}

#[async_trait]
impl MultipartCapability for S3Backend {
    #[instrument(skip(self, metadata), fields(backend = "s3"))]
    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &PutMetadata,
    ) -> StorageResult<MultipartInit> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_content_type(metadata.content_type.clone())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(MultipartInit {
            upload_id,
            expires_at: OffsetDateTime::now_utc()
                + time::Duration::seconds(SIGNED_URL_EXPIRY_SECS as i64),
        })
    }

    #[instrument(skip(self, body), fields(backend = "s3"))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ByteStream,
        content_length: u64,
    ) -> StorageResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(sdk_length(content_length)?)
            .body(streaming_body(body, content_length))
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Config("S3 did not return an ETag for part".to_string()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_multipart_upload_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> StorageResult<Option<Vec<MultipartPart>>> {
        let full_key = self.full_key(key);
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let output = match self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&full_key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
            {
                Ok(output) => output,
                // Aborted or expired by bucket lifecycle rules
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "Failed to list multipart upload parts");
                    return Err(map_s3_operation_error(err));
                }
            };

            for part in output.parts() {
                if let (Some(part_number), Some(etag)) = (part.part_number(), part.e_tag()) {
                    parts.push(MultipartPart {
                        part_number,
                        etag: etag.to_string(),
                    });
                }
            }

            match output.next_part_number_marker() {
                Some(next) if output.is_truncated() == Some(true) => {
                    marker = Some(next.to_string());
                }
                _ => break,
            }
        }

        Ok(Some(parts))
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<MultipartPart>,
    ) -> StorageResult<()> {
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(sorted_completed_parts(parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|err| {
                tracing::error!(key = %key, error = %err, "Failed to complete multipart upload");
                map_s3_operation_error(err)
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    return StorageError::NotFound(format!("upload {upload_id}"));
                }
                tracing::error!(key = %key, error = %err, "Failed to abort multipart upload");
                map_s3_operation_error(err)
            })?;
        Ok(())
    }
}
