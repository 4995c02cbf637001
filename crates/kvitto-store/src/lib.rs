//! # kvitto-store
//!
//! Content store for the kvitto pipeline: path-safe resolution under a
//! single storage root, streaming SHA-256 hashing, MIME detection,
//! dated-bucket relocation, and the filesystem lockfile.

pub mod hashing;
pub mod layout;
pub mod paths;
pub mod store;

pub use hashing::{sha256_bytes, sha256_file};
pub use layout::{StorageLayout, BUCKET_DIR, INCOMING_DIR, LOCKS_DIR, OPS_LOG_DIR, QUARANTINE_DIR};
pub use paths::{resolve_under, RelPath};
pub use store::{collision_name, ContentStore, Lockfile, MoveResult};
