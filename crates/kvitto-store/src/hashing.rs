//! Streaming SHA-256 content hashing.
//!
//! The lowercase hex digest is the global deduplication key, so both the
//! streaming and in-memory variants must agree byte-for-byte.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use kvitto_core::Result;

/// Read buffer size for streaming hashing (1 MiB).
const CHUNK_SIZE: usize = 1024 * 1024;

/// SHA-256 of a file's contents, streamed in 1 MiB chunks.
///
/// Returns the lowercase hex digest.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory payload (mailbox attachments), lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
