//! S3 backend tests against a MinIO container.
//!
//! Set `SKIP_S3_TESTS` to skip them. When Docker is unavailable the tests
//! print a notice and pass.

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use bytes::Bytes;
use cask_core::config::ProxyUploadConfig;
use cask_storage::{
    GetObject, MultipartPart, ProxyBackend, PutMetadata, S3Backend, S3Settings, StorageBackend,
    StorageBackendExt, bytes_stream, collect_stream,
};
use std::sync::Arc;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::{ContainerAsync, GenericImage, ImageExt, runners::AsyncRunner};

const MINIO_IMAGE: &str = "minio/minio";
const MINIO_TAG: &str = "RELEASE.2024-02-12T21-36-45Z";
const BUCKET: &str = "cask-test";

/// Smallest non-final part S3 accepts.
const MIN_PART: usize = 5 * 1024 * 1024;

fn should_skip_s3_tests() -> bool {
    std::env::var("SKIP_S3_TESTS").is_ok()
}

struct MinioContext {
    _container: ContainerAsync<GenericImage>,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl MinioContext {
    async fn start() -> Result<Self, String> {
        let access_key = "minio-access-key".to_string();
        let secret_key = "minio-secret-key".to_string();

        let container = GenericImage::new(MINIO_IMAGE, MINIO_TAG)
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("API:"))
            .with_env_var("MINIO_ROOT_USER", access_key.clone())
            .with_env_var("MINIO_ROOT_PASSWORD", secret_key.clone())
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .map_err(|e| format!("failed to start MinIO container: {e}"))?;

        let host = container
            .get_host()
            .await
            .map_err(|e| format!("failed to get host: {e}"))?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .map_err(|e| format!("failed to get port: {e}"))?;

        let context = Self {
            _container: container,
            endpoint: format!("http://{host}:{port}"),
            access_key,
            secret_key,
        };
        context.create_bucket().await?;
        Ok(context)
    }

    async fn create_bucket(&self) -> Result<(), String> {
        let credentials = Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            "test",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .credentials_provider(credentials)
            .http_client(aws_smithy_http_client::Builder::new().build_http())
            .endpoint_url(self.endpoint.clone())
            .force_path_style(true)
            .build();

        Client::from_conf(config)
            .create_bucket()
            .bucket(BUCKET)
            .send()
            .await
            .map_err(|e| format!("failed to create bucket: {e}"))?;
        Ok(())
    }

    async fn backend(&self, prefix: Option<&str>) -> S3Backend {
        let settings = S3Settings {
            endpoint: Some(self.endpoint.clone()),
            region: Some("us-east-1".to_string()),
            prefix: prefix.map(str::to_string),
            access_key_id: Some(self.access_key.clone()),
            secret_access_key: Some(self.secret_key.clone()),
            force_path_style: true,
            ..S3Settings::new(BUCKET)
        };
        S3Backend::new(settings).await.unwrap()
    }
}

macro_rules! minio_or_skip {
    () => {{
        if should_skip_s3_tests() {
            return;
        }
        match MinioContext::start().await {
            Ok(context) => context,
            Err(err) => {
                eprintln!("Skipping S3 test: {err}");
                return;
            }
        }
    }};
}

#[tokio::test]
async fn test_s3_object_lifecycle() {
    let minio = minio_or_skip!();
    let backend = minio.backend(Some("prefix")).await;
    backend.health_check().await.unwrap();

    let metadata = PutMetadata::new(Some("text/plain".to_string()), Some(5));
    backend
        .put("ws1/a", Bytes::from_static(b"hello"), &metadata)
        .await
        .unwrap();
    backend
        .put_stream("ws1/b", bytes_stream(Bytes::from_static(b"stream")), &PutMetadata::default())
        .await
        .unwrap();
    backend
        .put("ws2/c", Bytes::from_static(b"other"), &PutMetadata::default())
        .await
        .unwrap();

    let meta = backend.head("ws1/a").await.unwrap().unwrap();
    assert_eq!(meta.size, 5);
    assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
    assert!(backend.head("ws1/missing").await.unwrap().is_none());

    match backend.get("ws1/b", false).await.unwrap() {
        GetObject::Body { stream, .. } => {
            assert_eq!(collect_stream(stream).await.unwrap(), Bytes::from_static(b"stream"));
        }
        other => panic!("expected body, got {other:?}"),
    }
    assert!(matches!(
        backend.get("ws1/missing", false).await.unwrap(),
        GetObject::NotFound
    ));

    let mut keys: Vec<String> = backend
        .list("ws1/")
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.key)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["ws1/a".to_string(), "ws1/b".to_string()]);

    backend.delete("ws1/a").await.unwrap();
    backend.delete("ws1/a").await.unwrap();
    assert!(backend.head("ws1/a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_s3_multipart_out_of_order_completion() {
    let minio = minio_or_skip!();
    let backend = minio.backend(None).await;
    let multipart = backend.multipart_support().require().unwrap();
    let key = "ws/large";

    let init = multipart
        .create_multipart_upload(key, &PutMetadata::default())
        .await
        .unwrap();

    let first = Bytes::from(vec![1u8; MIN_PART]);
    let second = Bytes::from_static(b"tail");
    let etag2 = multipart
        .upload_part(key, &init.upload_id, 2, bytes_stream(second.clone()), second.len() as u64)
        .await
        .unwrap();
    let etag1 = multipart
        .upload_part(key, &init.upload_id, 1, bytes_stream(first.clone()), first.len() as u64)
        .await
        .unwrap();

    let mut parts = multipart
        .list_multipart_upload_parts(key, &init.upload_id)
        .await
        .unwrap()
        .unwrap();
    parts.sort_by_key(|p| p.part_number);
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].etag.trim_matches('"'), etag1.trim_matches('"'));

    multipart
        .complete_multipart_upload(
            key,
            &init.upload_id,
            vec![
                MultipartPart {
                    part_number: 2,
                    etag: etag2,
                },
                MultipartPart {
                    part_number: 1,
                    etag: etag1,
                },
            ],
        )
        .await
        .unwrap();

    let meta = backend.head(key).await.unwrap().unwrap();
    assert_eq!(meta.size, (MIN_PART + 4) as u64);
}

#[tokio::test]
async fn test_s3_aborted_upload_lists_as_missing() {
    let minio = minio_or_skip!();
    let backend = minio.backend(None).await;
    let multipart = backend.multipart_support().require().unwrap();

    let init = multipart
        .create_multipart_upload("ws/aborted", &PutMetadata::default())
        .await
        .unwrap();
    multipart
        .abort_multipart_upload("ws/aborted", &init.upload_id)
        .await
        .unwrap();

    let parts = multipart
        .list_multipart_upload_parts("ws/aborted", &init.upload_id)
        .await
        .unwrap();
    assert!(parts.is_none());
}

#[tokio::test]
async fn test_proxy_relay_writes_to_bucket() {
    let minio = minio_or_skip!();
    let inner: Arc<dyn StorageBackend> = Arc::new(minio.backend(Some("relay")).await);
    let proxy = ProxyBackend::new(
        inner,
        &ProxyUploadConfig {
            enabled: true,
            url_prefix: None,
            sign_key: Some("relay-key".to_string()),
        },
    )
    .unwrap();

    let relay = proxy.proxy_upload_support().require().unwrap();
    relay
        .proxy_put_object(
            "ws/relayed",
            bytes_stream(Bytes::from_static(b"relayed bytes")),
            &PutMetadata::new(Some("application/json".to_string()), Some(13)),
        )
        .await
        .unwrap();

    let meta = proxy.head("ws/relayed").await.unwrap().unwrap();
    assert_eq!(meta.size, 13);
    assert_eq!(meta.content_type.as_deref(), Some("application/json"));

    let presigned = proxy
        .presign_support()
        .require()
        .unwrap()
        .presign_put("ws/relayed", &PutMetadata::default())
        .await
        .unwrap();
    assert!(presigned.url.starts_with("/api/storage/upload?"));
}
