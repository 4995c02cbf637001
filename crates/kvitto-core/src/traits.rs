//! Core traits for kvitto abstractions.
//!
//! These traits define the seams between the pipeline and its backing
//! services: the document registry, brand/event/job-run stores, the mailbox
//! provider, and the embedding backend. Concrete implementations live in
//! `kvitto-db` (PostgreSQL) and `kvitto-pipeline` (HTTP embedder, test
//! doubles).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// DOCUMENT REGISTRY
// =============================================================================

/// The single source of truth for documents, their lines, and their states.
///
/// Uniqueness by content hash is enforced by constraint at insert time;
/// `find_by_hash` is a best-effort fast path only. State transitions are
/// guarded: callers name the state they expect to find, not just the state
/// they want to set.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Insert a new document in `collected` state. Fails with
    /// `Error::DuplicateContent` if the content hash (or provider attachment
    /// id) already exists.
    async fn create_collected(&self, req: CreateDocumentRequest) -> Result<Document>;

    /// Fast-path duplicate filter by content hash.
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;

    /// Secondary dedup key: provider-specific attachment identifier.
    async fn find_by_attachment_ref(&self, provider_attachment_id: &str)
        -> Result<Option<Document>>;

    /// Fetch a document by id.
    async fn get(&self, id: Uuid) -> Result<Document>;

    /// List documents in a state, filtered by scope, ordered by creation time.
    async fn list_in_state(&self, state: DocState, scope: &DocumentScope)
        -> Result<Vec<Document>>;

    /// Guarded state transition. Fails with `Error::InvalidTransition` when
    /// the document is not in `from_expected` at write time.
    async fn transition(&self, id: Uuid, from_expected: DocState, to: DocState) -> Result<()>;

    /// Administrative escape hatch: clear derived fields (raw text, lines,
    /// brand) and return to `collected`. The only allowed backward
    /// transition.
    async fn reset_to_collected(&self, id: Uuid) -> Result<()>;

    /// Record the new location after a file relocation.
    async fn update_location(&self, id: Uuid, source_path: &str, stored_filename: &str)
        -> Result<()>;

    /// Apply a text extraction result as one atomic unit: guarded state check
    /// (`collected`), wholesale line replacement, raw text + hash update,
    /// transition to `text_extracted`, success event.
    async fn apply_extraction(
        &self,
        id: Uuid,
        raw_text: &str,
        raw_text_hash: &str,
        lines: &[NewLine],
        duration_ms: i64,
    ) -> Result<()>;

    /// All lines of a document in source order.
    async fn lines(&self, document_id: Uuid) -> Result<Vec<Line>>;

    /// Lines that have an embedding, in source order.
    async fn embedded_lines(&self, document_id: Uuid) -> Result<Vec<Line>>;

    /// Store embeddings for the given line numbers.
    async fn set_line_embeddings(
        &self,
        document_id: Uuid,
        embeddings: &[(i32, Vector)],
    ) -> Result<()>;

    /// Persist a brand match and advance `vectorized → brand_identified`
    /// under the usual guard.
    async fn set_brand(&self, id: Uuid, brand: &BrandMatch, duration_ms: i64) -> Result<()>;
}

// =============================================================================
// BRANDS
// =============================================================================

/// Request for creating a brand with its alias set.
#[derive(Debug, Clone)]
pub struct CreateBrandRequest {
    pub name: String,
    pub aliases: Vec<String>,
    pub website: String,
    pub metadata: JsonValue,
}

/// Store for brand reference data and per-alias embeddings.
#[async_trait]
pub trait BrandRepository: Send + Sync {
    /// Create a brand; name uniqueness is case-insensitive. The canonical
    /// name is seeded as an alias alongside the given variants.
    async fn create(&self, req: CreateBrandRequest) -> Result<Brand>;

    /// Fetch a brand by id.
    async fn get(&self, id: Uuid) -> Result<Brand>;

    /// Store or replace the embedding for one alias of a brand.
    async fn set_alias_embedding(&self, brand_id: Uuid, alias: &str, embedding: &Vector)
        -> Result<()>;

    /// All `(alias, embedding, brand)` tuples across all brands, for the
    /// brand identification stage. Aliases without embeddings are omitted.
    async fn alias_embeddings(&self) -> Result<Vec<AliasEmbedding>>;
}

// =============================================================================
// AUDIT TRAIL
// =============================================================================

/// Append-only store for processing events.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append one event; rows are never mutated afterwards.
    async fn record(&self, event: NewEvent) -> Result<Uuid>;

    /// Events for one document, oldest first.
    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<ProcessingEvent>>;
}

// =============================================================================
// JOB RUNS
// =============================================================================

/// Request for creating a job run row.
#[derive(Debug, Clone)]
pub struct NewJobRun {
    pub job_name: String,
    pub status: JobStatus,
    pub triggered_by: TriggeredBy,
    pub params: JsonValue,
    pub log_path: String,
}

/// Durable bookkeeping for pipeline invocations.
#[async_trait]
pub trait JobRunRepository: Send + Sync {
    /// Create a run row (status `running`, or `skipped` at creation when a
    /// concurrent run holds the lock).
    async fn create(&self, req: NewJobRun) -> Result<JobRun>;

    /// Move a running row to its terminal status exactly once.
    async fn finish(&self, id: Uuid, status: JobStatus, error_message: Option<&str>)
        -> Result<()>;

    /// Set one metric key. Each call performs its own durable write so a
    /// crash mid-run leaves partial metrics visible.
    async fn set_metric(&self, id: Uuid, key: &str, value: JsonValue) -> Result<()>;

    /// Increment one integer metric key.
    async fn inc_metric(&self, id: Uuid, key: &str, by: i64) -> Result<()>;

    /// Fetch a run by id.
    async fn get(&self, id: Uuid) -> Result<JobRun>;
}

// =============================================================================
// MAILBOX PROVIDER
// =============================================================================

/// An attachment descriptor as reported by the mailbox provider.
#[derive(Debug, Clone)]
pub struct MailAttachment {
    /// Provider-specific attachment identifier (secondary dedup key).
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    /// Whether the part is referenced inline (signature logos etc.) rather
    /// than as a regular attachment.
    pub inline: bool,
}

/// A candidate message with its flattened attachment list.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<MailAttachment>,
}

/// Post-processing label applied to a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Imported,
    Quarantined,
}

/// Opaque mailbox capability: list candidates, fetch bytes, mutate labels.
/// Authentication and transport are the provider's concern.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Messages matching the filter expression, optionally bounded by a
    /// "since" date, in provider-returned order.
    async fn list_messages(
        &self,
        query: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MailMessage>>;

    /// Fetch the raw bytes of one attachment.
    async fn fetch_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>>;

    /// Best-effort label mutation after processing (mark read / tag
    /// imported-or-quarantined). Runs strictly after persistence; failures
    /// are logged and counted by the caller, never fatal.
    async fn mark_processed(&self, message_id: &str, disposition: MessageDisposition)
        -> Result<()>;
}

// =============================================================================
// EMBEDDING BACKEND
// =============================================================================

/// Opaque `texts → fixed-length vectors` capability. Model inference
/// internals are out of scope; implementations include an Ollama-compatible
/// HTTP backend and a deterministic mock.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a batch of texts; the result has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>>;
}
