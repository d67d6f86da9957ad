//! Proxy upload relay.
//!
//! These routes carry no session auth. A request is authorized only by the
//! HMAC token minted by [`cask_storage::ProxyBackend`], which binds the
//! route, every query field and the expiry. The body is streamed straight
//! into the backend.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{PROXY_BYTES, record_proxy_upload};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use cask_core::{
    DEFAULT_MIME, MULTIPART_PART_SIZE, PROXY_MULTIPART_PATH, PROXY_UPLOAD_PATH,
    multipart_part_count, object_key,
};
use cask_metadata::{BlobRepo, BlobRow};
use cask_storage::{ByteStream, ProxyUploadCapability, PutMetadata, StorageBackend, StorageError};
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;

/// Query string of `PUT /api/storage/upload`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyUploadQuery {
    pub workspace_id: Option<String>,
    pub key: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<String>,
    pub exp: Option<String>,
    pub token: Option<String>,
}

/// Query string of `PUT /api/storage/multipart`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMultipartQuery {
    pub workspace_id: Option<String>,
    pub key: Option<String>,
    pub upload_id: Option<String>,
    pub part_number: Option<String>,
    pub exp: Option<String>,
    pub token: Option<String>,
}

fn required<'a>(value: &'a Option<String>, field: &str) -> ApiResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::invalid(format!("Missing {field}.")))
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str) -> ApiResult<T> {
    value
        .parse()
        .map_err(|_| ApiError::invalid(format!("Invalid {field}.")))
}

fn content_length_header(headers: &HeaderMap) -> ApiResult<Option<u64>> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Some)
            .ok_or_else(|| ApiError::invalid("Invalid Content-Length header")),
    }
}

fn body_stream(body: Body) -> ByteStream {
    Box::pin(
        body.into_data_stream()
            .map_err(|e| StorageError::Io(std::io::Error::other(e))),
    )
}

async fn proxy_backend(state: &AppState) -> ApiResult<Arc<dyn StorageBackend>> {
    state.storage.get().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to resolve storage backend");
        ApiError::invalid("Invalid endpoint")
    })
}

/// The backend must be in proxy mode.
fn proxy_capability(backend: &dyn StorageBackend) -> ApiResult<&dyn ProxyUploadCapability> {
    backend
        .proxy_upload()
        .ok_or_else(|| ApiError::invalid("Invalid endpoint"))
}

fn check_expiry(exp: i64) -> ApiResult<()> {
    if exp < OffsetDateTime::now_utc().unix_timestamp() {
        return Err(ApiError::invalid("Upload URL expired"));
    }
    Ok(())
}

async fn load_record(
    state: &AppState,
    workspace_id: &str,
    key: &str,
    missing: &str,
) -> ApiResult<BlobRow> {
    let record = state
        .metadata
        .get_blob(workspace_id, key)
        .await
        .map_err(|e| {
            tracing::error!(workspace_id = %workspace_id, key = %key, error = %e, "Failed to load blob record");
            ApiError::invalid("Upload failed")
        })?
        .ok_or_else(|| ApiError::invalid(missing))?;
    if record.is_completed() {
        return Err(ApiError::invalid("Blob upload is already completed"));
    }
    Ok(record)
}

/// Reconcile the query length with the header. Returns the body length.
fn resolve_length(query_length: Option<u64>, header_length: Option<u64>) -> ApiResult<u64> {
    if let (Some(query), Some(header)) = (query_length, header_length)
        && query != header
    {
        return Err(ApiError::invalid("Content length mismatch"));
    }
    header_length
        .or(query_length)
        .ok_or_else(|| ApiError::invalid("Missing Content-Length header"))
}

/// Whether a part of `length` bytes at `part_index` ends within `size`.
fn part_fits(part_index: u64, length: u64, size: u64) -> bool {
    if length > size {
        return false;
    }
    part_index
        .checked_mul(MULTIPART_PART_SIZE)
        .and_then(|offset| offset.checked_add(length))
        .is_some_and(|end| end <= size)
}

/// Count the request in metrics and hide backend internals from rejections.
fn finish<T>(route: &str, result: ApiResult<T>) -> ApiResult<T> {
    let result = result.map_err(|e| match e {
        ApiError::InvalidRequest(_) => e,
        other => {
            tracing::error!(route = %route, error = %other, "Upload failed");
            ApiError::invalid("Upload failed")
        }
    });
    let label = match &result {
        Ok(_) => "ok",
        Err(ApiError::InvalidRequest(message)) if message == "Upload failed" => "failed",
        Err(_) => "rejected",
    };
    record_proxy_upload(route, label);
    result
}

/// PUT /api/storage/upload - Relay a single-object upload.
#[tracing::instrument(skip(state, query, headers, body), fields(workspace_id = ?query.workspace_id, key = ?query.key))]
pub async fn proxy_upload(
    State(state): State<AppState>,
    Query(query): Query<ProxyUploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<StatusCode> {
    finish("upload", relay_upload(&state, &query, &headers, body).await)
}

async fn relay_upload(
    state: &AppState,
    query: &ProxyUploadQuery,
    headers: &HeaderMap,
    body: Body,
) -> ApiResult<StatusCode> {
    let backend = proxy_backend(state).await?;
    let proxy = proxy_capability(backend.as_ref())?;

    let workspace_id = required(&query.workspace_id, "workspaceId")?;
    let key = required(&query.key, "key")?;
    let exp_raw = required(&query.exp, "exp")?;
    let token = required(&query.token, "token")?;
    let exp: i64 = parse_number(exp_raw, "exp")?;
    let query_length = query
        .content_length
        .as_deref()
        .map(|v| parse_number::<u64>(v, "contentLength"))
        .transpose()?;

    check_expiry(exp)?;

    let fields = [
        Some(workspace_id),
        Some(key),
        query.content_type.as_deref(),
        query.content_length.as_deref(),
    ];
    if !proxy.verify_upload_token(PROXY_UPLOAD_PATH, &fields, exp, token) {
        return Err(ApiError::invalid("Invalid upload token"));
    }

    let record = load_record(state, workspace_id, key, "Blob upload is not initialized").await?;

    let length = resolve_length(query_length, content_length_header(headers)?)?;
    if length != record.size_bytes() {
        return Err(ApiError::invalid(
            "Content length does not match upload metadata",
        ));
    }
    let content_type = query.content_type.as_deref().unwrap_or(DEFAULT_MIME);
    if content_type != record.mime {
        return Err(ApiError::invalid("Mime type mismatch"));
    }

    let metadata = PutMetadata::new(Some(content_type.to_string()), Some(length));
    proxy
        .proxy_put_object(&object_key(workspace_id, key), body_stream(body), &metadata)
        .await
        .map_err(|e| {
            tracing::error!(workspace_id = %workspace_id, key = %key, error = %e, "Upload failed");
            ApiError::invalid("Upload failed")
        })?;

    PROXY_BYTES.inc_by(length);
    Ok(StatusCode::OK)
}

/// PUT /api/storage/multipart - Relay one multipart part.
#[tracing::instrument(skip(state, query, headers, body), fields(workspace_id = ?query.workspace_id, key = ?query.key))]
pub async fn proxy_multipart(
    State(state): State<AppState>,
    Query(query): Query<ProxyMultipartQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    finish(
        "multipart",
        relay_multipart(&state, &query, &headers, body).await,
    )
}

async fn relay_multipart(
    state: &AppState,
    query: &ProxyMultipartQuery,
    headers: &HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let backend = proxy_backend(state).await?;
    let proxy = proxy_capability(backend.as_ref())?;

    let workspace_id = required(&query.workspace_id, "workspaceId")?;
    let key = required(&query.key, "key")?;
    let upload_id = required(&query.upload_id, "uploadId")?;
    let part_number_raw = required(&query.part_number, "partNumber")?;
    let exp_raw = required(&query.exp, "exp")?;
    let token = required(&query.token, "token")?;
    let part_number: i32 = parse_number(part_number_raw, "partNumber")?;
    let exp: i64 = parse_number(exp_raw, "exp")?;
    if part_number < 1 {
        return Err(ApiError::invalid("Invalid part number"));
    }

    check_expiry(exp)?;

    let fields = [
        Some(workspace_id),
        Some(key),
        Some(upload_id),
        Some(part_number_raw),
    ];
    if !proxy.verify_upload_token(PROXY_MULTIPART_PATH, &fields, exp, token) {
        return Err(ApiError::invalid("Invalid upload token"));
    }

    let record =
        load_record(state, workspace_id, key, "Multipart upload is not initialized").await?;

    let length = resolve_length(None, content_length_header(headers)?)?;
    if length == 0 {
        return Err(ApiError::invalid("Missing Content-Length header"));
    }

    if record.upload_id.as_deref() != Some(upload_id) {
        return Err(ApiError::invalid("Upload id mismatch"));
    }
    let size = record.size_bytes();
    let part_index = u64::try_from(part_number - 1).unwrap_or(0);
    if part_index + 1 > multipart_part_count(size) {
        return Err(ApiError::invalid("Part number exceeds upload size"));
    }
    if !part_fits(part_index, length, size) {
        return Err(ApiError::invalid("Part size exceeds upload metadata"));
    }

    let etag = proxy
        .proxy_upload_part(
            &object_key(workspace_id, key),
            upload_id,
            part_number,
            body_stream(body),
            length,
        )
        .await
        .map_err(|e| {
            tracing::error!(
                workspace_id = %workspace_id,
                key = %key,
                upload_id = %upload_id,
                part_number,
                error = %e,
                "Upload failed"
            );
            ApiError::invalid("Upload failed")
        })?;

    PROXY_BYTES.inc_by(length);
    Ok((StatusCode::OK, [(header::ETAG, etag)]).into_response())
}
