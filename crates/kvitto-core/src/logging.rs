//! Structured logging schema and field name constants for kvitto.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation tools can query by the same names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, job completions, documents created |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (files walked, lines embedded) |

use tracing_subscriber::EnvFilter;

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "store", "db", "pipeline", "mailbox", "embedding"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "dir_scanner", "collector", "coordinator", "content_store"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "scan", "collect", "extract_text", "identify_brand"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Document UUID being operated on.
pub const DOCUMENT_ID: &str = "document_id";

/// Job run UUID.
pub const JOBRUN_ID: &str = "jobrun_id";

/// Job name ("scan_receipts", "collect_mailbox", ...).
pub const JOB_NAME: &str = "job_name";

/// SHA-256 content digest (lowercase hex).
pub const CONTENT_HASH: &str = "content_hash";

/// Provider-side message id.
pub const MESSAGE_ID: &str = "message_id";

/// Provider-side attachment id.
pub const ATTACHMENT_ID: &str = "attachment_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of files or attachments inspected.
pub const SCANNED: &str = "scanned";

/// Number of documents created.
pub const CREATED: &str = "created";

/// Number of duplicates skipped.
pub const DUPLICATES: &str = "duplicates";

/// Byte size of a file or attachment.
pub const SIZE_BYTES: &str = "size_bytes";

/// Number of lines embedded or scored.
pub const LINE_COUNT: &str = "line_count";

// ─── Inference fields ──────────────────────────────────────────────────────

/// Embedding model name.
pub const MODEL: &str = "model";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `info` for kvitto crates and `warn`
/// for everything else. Safe to call once at process start.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,kvitto=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
