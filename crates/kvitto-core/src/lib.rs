//! # kvitto-core
//!
//! Core types, traits, and abstractions for the kvitto receipt pipeline.
//!
//! This crate provides the foundational data structures and trait definitions
//! that other kvitto crates depend on.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{Config, EmbeddingConfig, MailboxConfig, ScanConfig};
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
