//! HTTP server for the cask blob store.
//!
//! This crate provides:
//! - [`blobs::BlobStore`], orchestrating blob records and stored objects
//! - The upload reaper for abandoned pending uploads
//! - The proxy upload relay endpoints
//! - Health and Prometheus endpoints

pub mod blobs;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use blobs::{BlobStore, UploadReaper};
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
