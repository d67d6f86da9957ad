//! Application state shared across handlers.

use crate::blobs::BlobStore;
use cask_core::config::AppConfig;
use cask_metadata::MetadataStore;
use cask_storage::BackendHandle;
use std::sync::Arc;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Storage backend, rebuilt on reconfiguration.
    pub storage: Arc<BackendHandle>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Blob orchestration over `storage` and `metadata`.
    pub blobs: BlobStore,
}

impl AppState {
    /// Create a new application state.
    ///
    /// Spawns the blob event worker, so this must run inside a tokio runtime.
    pub fn new(
        config: AppConfig,
        storage: Arc<BackendHandle>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let blobs = BlobStore::new(storage.clone(), metadata.clone());
        Self::with_blobs(config, storage, metadata, blobs)
    }

    /// Create a state around an existing [`BlobStore`].
    pub fn with_blobs(
        config: AppConfig,
        storage: Arc<BackendHandle>,
        metadata: Arc<dyn MetadataStore>,
        blobs: BlobStore,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            metadata,
            blobs,
        }
    }
}
