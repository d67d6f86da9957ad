//! Health endpoint.

use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use cask_storage::StorageBackend;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage: &'static str,
    pub metadata: &'static str,
}

async fn storage_ok(state: &AppState) -> bool {
    match state.storage.get().await {
        Ok(backend) => match backend.health_check().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = backend.backend_name(), error = %e, "Storage health check failed");
                false
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Storage backend unavailable");
            false
        }
    }
}

/// GET /api/health - Health check.
///
/// Unauthenticated. Reports each component separately and answers 503 when
/// either is down.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let storage = storage_ok(&state).await;
    let metadata = match state.metadata.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Metadata health check failed");
            false
        }
    };

    let label = |ok: bool| if ok { "ok" } else { "error" };
    let (status, code) = if storage && metadata {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(HealthResponse {
            status,
            storage: label(storage),
            metadata: label(metadata),
        }),
    )
}
