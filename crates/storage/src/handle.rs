//! Lazily built, hot-swappable storage backend.

use crate::error::StorageResult;
use crate::from_config;
use crate::traits::StorageBackend;
use cask_core::config::StorageConfig;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Owns the configured backend and rebuilds it on reconfiguration.
///
/// The backend is constructed on first use. Callers that obtained an `Arc`
/// before a [`BackendHandle::reconfigure`] keep the old instance until they
/// drop it.
pub struct BackendHandle {
    config: RwLock<StorageConfig>,
    backend: RwLock<Option<Arc<dyn StorageBackend>>>,
}

impl BackendHandle {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config: RwLock::new(config),
            backend: RwLock::new(None),
        }
    }

    /// Wrap an already built backend.
    pub fn from_backend(config: StorageConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            config: RwLock::new(config),
            backend: RwLock::new(Some(backend)),
        }
    }

    /// The current backend, building it if needed.
    pub async fn get(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        if let Some(backend) = self.backend.read().await.as_ref() {
            return Ok(Arc::clone(backend));
        }

        let mut slot = self.backend.write().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(Arc::clone(backend));
        }
        let config = self.config.read().await.clone();
        let backend = from_config(&config).await?;
        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Replace the configuration and drop the cached backend.
    ///
    /// The new configuration is validated by building it eagerly, so a bad
    /// reload leaves the previous backend in place.
    pub async fn reconfigure(&self, config: StorageConfig) -> StorageResult<()> {
        let backend = from_config(&config).await?;
        let mut slot = self.backend.write().await;
        *self.config.write().await = config;
        info!(backend = backend.backend_name(), "Storage backend reconfigured");
        *slot = Some(backend);
        Ok(())
    }

    pub async fn config(&self) -> StorageConfig {
        self.config.read().await.clone()
    }
}
