//! Upload reaper integration tests.

mod common;

use cask_core::config::ReaperConfig;
use cask_core::{DEFAULT_MIME, object_key};
use cask_metadata::{BlobRepo, BlobUpsert};
use cask_server::UploadReaper;
use cask_storage::{MultipartCapability, PutMetadata};
use common::*;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

fn reaper_config(batch_size: u32) -> ReaperConfig {
    ReaperConfig {
        enabled: true,
        batch_size,
        ..ReaperConfig::default()
    }
}

#[tokio::test]
async fn test_reaper_scenario() {
    let recorder = Arc::new(RecordingBackend::new());
    let server = TestServer::recording(&recorder).await;
    let metadata = server.metadata();
    let ws = workspace("reaper");
    let now = OffsetDateTime::now_utc();
    let old = now - Duration::hours(25);

    // Abandoned multipart upload
    let init = recorder
        .create_multipart_upload(&object_key(&ws, "pending-multipart"), &PutMetadata::default())
        .await
        .unwrap();
    metadata
        .upsert_blob(
            &BlobUpsert::pending(&ws, "pending-multipart", 100, DEFAULT_MIME, Some(init.upload_id))
                .at(old),
        )
        .await
        .unwrap();

    // Abandoned single put that did land bytes
    recorder.insert_object(&object_key(&ws, "pending-single"), b"partial".to_vec(), None);
    metadata
        .upsert_blob(&BlobUpsert::pending(&ws, "pending-single", 7, DEFAULT_MIME, None).at(old))
        .await
        .unwrap();

    // Old but completed
    recorder.insert_object(&object_key(&ws, "completed-keep"), b"kept".to_vec(), None);
    metadata
        .upsert_blob(&BlobUpsert::completed(&ws, "completed-keep", 4, DEFAULT_MIME).at(old))
        .await
        .unwrap();

    // Pending but recent
    metadata
        .upsert_blob(&BlobUpsert::pending(&ws, "pending-active", 9, DEFAULT_MIME, None).at(now))
        .await
        .unwrap();

    let reaper = UploadReaper::new(server.blobs().clone(), reaper_config(100));
    let stats = reaper.run(now).await.unwrap();

    assert_eq!(stats.processed, 2);
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.errors, 0);
    assert_eq!(recorder.count(Call::AbortMultipart), 1);
    assert_eq!(recorder.count(Call::Delete), 2);
    assert_eq!(recorder.open_uploads(), 0);

    let mut remaining = Vec::new();
    for key in ["pending-multipart", "pending-single", "completed-keep", "pending-active"] {
        if metadata.get_blob(&ws, key).await.unwrap().is_some() {
            remaining.push(key);
        }
    }
    assert_eq!(remaining, vec!["completed-keep", "pending-active"]);
    assert!(recorder.object(&object_key(&ws, "pending-single")).is_none());
    assert!(recorder.object(&object_key(&ws, "completed-keep")).is_some());
}

#[tokio::test]
async fn test_reaper_continues_after_failures() {
    let recorder = Arc::new(RecordingBackend::new());
    let server = TestServer::recording(&recorder).await;
    let metadata = server.metadata();
    let ws = workspace("reaper-errors");
    let now = OffsetDateTime::now_utc();
    let old = now - Duration::days(2);

    // The upload id is unknown to the backend, so it counts as already aborted
    metadata
        .upsert_blob(
            &BlobUpsert::pending(&ws, "a-unknown-upload", 1, DEFAULT_MIME, Some("gone".to_string()))
                .at(old),
        )
        .await
        .unwrap();
    // The object delete fails, so the row stays for the next run
    recorder.fail_delete(&object_key(&ws, "b-stuck"));
    metadata
        .upsert_blob(&BlobUpsert::pending(&ws, "b-stuck", 1, DEFAULT_MIME, None).at(old))
        .await
        .unwrap();
    metadata
        .upsert_blob(&BlobUpsert::pending(&ws, "c-fine", 1, DEFAULT_MIME, None).at(old))
        .await
        .unwrap();
    // The abort fails transiently, so the row keeps the upload id for a retry
    let init = recorder
        .create_multipart_upload(&object_key(&ws, "d-abort-fails"), &PutMetadata::default())
        .await
        .unwrap();
    recorder.fail_abort(&init.upload_id);
    metadata
        .upsert_blob(
            &BlobUpsert::pending(&ws, "d-abort-fails", 1, DEFAULT_MIME, Some(init.upload_id.clone()))
                .at(old),
        )
        .await
        .unwrap();

    // Batches of one exercise the cursor across failures
    let reaper = UploadReaper::new(server.blobs().clone(), reaper_config(1));
    let stats = reaper.run(now).await.unwrap();

    assert_eq!(stats.processed, 4);
    assert_eq!(stats.aborted, 0);
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.errors, 2);

    assert!(metadata.get_blob(&ws, "a-unknown-upload").await.unwrap().is_none());
    assert!(metadata.get_blob(&ws, "b-stuck").await.unwrap().is_some());
    assert!(metadata.get_blob(&ws, "c-fine").await.unwrap().is_none());
    let kept = metadata.get_blob(&ws, "d-abort-fails").await.unwrap().unwrap();
    assert_eq!(kept.upload_id.as_deref(), Some(init.upload_id.as_str()));
    assert_eq!(recorder.open_uploads(), 1);
}

#[tokio::test]
async fn test_reaper_without_multipart_support() {
    let recorder = Arc::new(RecordingBackend::plain());
    let server = TestServer::recording(&recorder).await;
    let metadata = server.metadata();
    let ws = workspace("reaper-plain");
    let now = OffsetDateTime::now_utc();

    metadata
        .upsert_blob(
            &BlobUpsert::pending(&ws, "stale", 1, DEFAULT_MIME, Some("upload-x".to_string()))
                .at(now - Duration::hours(30)),
        )
        .await
        .unwrap();

    let reaper = UploadReaper::new(server.blobs().clone(), reaper_config(10));
    let stats = reaper.run(now).await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.aborted, 0);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(recorder.count(Call::AbortMultipart), 0);
}
