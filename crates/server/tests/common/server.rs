//! Server test utilities.

use super::storage::{RecordingBackend, proxied_handle, recording_handle};
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use bytes::Bytes;
use cask_core::config::{AppConfig, MetadataConfig, StorageConfig};
use cask_metadata::{MetadataStore, SqliteStore};
use cask_server::blobs::{BlobEvent, BlobStore};
use cask_server::{AppState, create_router};
use cask_storage::BackendHandle;
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
///
/// The blob store is detached: events it emits land in `events` and are only
/// handled when a test calls [`TestServer::drain_events`].
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub events: mpsc::UnboundedReceiver<BlobEvent>,
    _temp_dir: TempDir,
}

/// A response with its body collected.
#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[allow(dead_code)]
impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }

    /// The `message` of a `{code, message}` error body.
    pub fn message(&self) -> String {
        self.json()["message"]
            .as_str()
            .expect("error message")
            .to_string()
    }
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server over a filesystem backend.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a filesystem-backed test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let storage_config = StorageConfig::Filesystem {
            path: temp_dir.path().join("storage"),
        };
        let storage = Arc::new(BackendHandle::new(storage_config.clone()));
        Self::build(temp_dir, storage, storage_config, modifier).await
    }

    /// Create a test server serving `recorder` directly.
    pub async fn recording(recorder: &Arc<RecordingBackend>) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let storage = recording_handle(recorder);
        let storage_config = storage.config().await;
        Self::build(temp_dir, storage, storage_config, |_| {}).await
    }

    /// Create a test server serving `recorder` behind the proxy decorator.
    pub async fn proxied(recorder: &Arc<RecordingBackend>, enabled: bool) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let storage = proxied_handle(recorder, enabled);
        let storage_config = storage.config().await;
        Self::build(temp_dir, storage, storage_config, |_| {}).await
    }

    async fn build<F>(
        temp_dir: TempDir,
        storage: Arc<BackendHandle>,
        storage_config: StorageConfig,
        modifier: F,
    ) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.storage = storage_config;
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        modifier(&mut config);

        let (blobs, events) = BlobStore::detached(storage.clone(), metadata.clone());
        let state = AppState::with_blobs(config, storage, metadata, blobs);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            events,
            _temp_dir: temp_dir,
        }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.state.blobs
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Handle every queued blob event. Returns how many were handled.
    pub async fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.state.blobs.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Take every queued blob event without handling it.
    pub fn take_events(&mut self) -> Vec<BlobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Send a request through the router and collect the response.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("valid request");
        self.send(request).await
    }

    /// PUT `data` with a matching Content-Length header.
    pub async fn put(&self, uri: &str, data: impl Into<Bytes>) -> TestResponse {
        let data = data.into();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(header::CONTENT_LENGTH, data.len())
            .body(Body::from(data))
            .expect("valid request");
        self.send(request).await
    }
}
