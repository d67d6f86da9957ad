//! Repository traits for metadata operations.

pub mod blobs;

pub use blobs::BlobRepo;
