//! Fire-and-forget blob maintenance events.
//!
//! Listing fallbacks and workspace-wide deletes enqueue one event per blob.
//! A spawned worker drains the queue and handles each event on its own, so
//! one failing blob never blocks the rest.

use super::BlobStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A maintenance action on one blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobEvent {
    /// Reconcile the record with the object in storage.
    Sync { workspace_id: String, key: String },
    /// Delete the object and the record.
    Delete { workspace_id: String, key: String },
}

impl BlobEvent {
    pub fn sync(workspace_id: &str, key: &str) -> Self {
        Self::Sync {
            workspace_id: workspace_id.to_string(),
            key: key.to_string(),
        }
    }

    pub fn delete(workspace_id: &str, key: &str) -> Self {
        Self::Delete {
            workspace_id: workspace_id.to_string(),
            key: key.to_string(),
        }
    }
}

/// Sending half of the event queue.
#[derive(Clone, Debug)]
pub struct BlobEvents {
    tx: mpsc::UnboundedSender<BlobEvent>,
}

impl BlobEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BlobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue an event without waiting for it to be handled.
    pub fn emit(&self, event: BlobEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(event = ?e.0, "Blob event queue closed, dropping event");
        }
    }
}

/// Spawn the worker that drains `rx` into `store`.
pub fn spawn_worker(store: BlobStore, mut rx: mpsc::UnboundedReceiver<BlobEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            debug!(event = ?event, "Handling blob event");
            store.handle_event(event).await;
        }
    })
}
