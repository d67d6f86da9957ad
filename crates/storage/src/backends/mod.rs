//! Storage backend implementations.

pub mod filesystem;
pub mod proxy;
pub mod s3;
