//! Test fixtures for generating test data.

use bytes::Bytes;
use cask_core::ContentHash;
use sha2::{Digest, Sha256};

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// The blob key of `data`: unpadded base64url SHA-256.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn blob_key(data: &[u8]) -> String {
    let digest: [u8; 32] = Sha256::digest(data).into();
    ContentHash::from_bytes(digest).to_blob_key()
}

/// A workspace id unique to the calling test.
#[allow(dead_code)]
pub fn workspace(name: &str) -> String {
    format!("ws-{name}")
}
