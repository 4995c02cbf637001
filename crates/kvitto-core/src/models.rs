//! Core data models for kvitto.
//!
//! These types are shared across all kvitto crates and represent the
//! central domain entities: documents, lines, brands, processing events
//! and job runs.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// =============================================================================
// DOCUMENT STATE MACHINE
// =============================================================================

/// Processing state of a document. Strictly ordered; the only backward
/// transition is the explicit administrative reset to `Collected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocState {
    Collected,
    TextExtracted,
    Vectorized,
    BrandIdentified,
}

impl DocState {
    /// Convert to the database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocState::Collected => "collected",
            DocState::TextExtracted => "text_extracted",
            DocState::Vectorized => "vectorized",
            DocState::BrandIdentified => "brand_identified",
        }
    }

    /// Parse from the database string representation.
    pub fn from_str(s: &str) -> Option<DocState> {
        match s {
            "collected" => Some(DocState::Collected),
            "text_extracted" => Some(DocState::TextExtracted),
            "vectorized" => Some(DocState::Vectorized),
            "brand_identified" => Some(DocState::BrandIdentified),
            _ => None,
        }
    }

    /// The next state in the pipeline, if any.
    pub fn next(&self) -> Option<DocState> {
        match self {
            DocState::Collected => Some(DocState::TextExtracted),
            DocState::TextExtracted => Some(DocState::Vectorized),
            DocState::Vectorized => Some(DocState::BrandIdentified),
            DocState::BrandIdentified => None,
        }
    }

    /// Whether moving from `self` to `to` is a forward transition.
    pub fn can_advance_to(&self, to: DocState) -> bool {
        to > *self
    }
}

impl std::fmt::Display for DocState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// DOCUMENT TYPES
// =============================================================================

/// Where a document was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentSource {
    Dir,
    Mailbox,
}

impl DocumentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentSource::Dir => "dir",
            DocumentSource::Mailbox => "mailbox",
        }
    }

    pub fn from_str(s: &str) -> Option<DocumentSource> {
        match s {
            "dir" => Some(DocumentSource::Dir),
            "mailbox" => Some(DocumentSource::Mailbox),
            _ => None,
        }
    }
}

/// The central entity: one ingested receipt document and its derived state.
///
/// Paths are storage-root-relative POSIX paths; `source_path` is the
/// directory of the current file location and is mutated on relocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub state: DocState,
    /// SHA-256 hex digest of the original payload; globally unique.
    pub content_hash: String,
    pub source_path: String,
    /// Provenance filename as received.
    pub original_filename: String,
    /// On-disk filename; differs from `original_filename` only when a
    /// collision suffix was applied at write time.
    pub stored_filename: String,
    pub mime_type: String,
    pub size_bytes: Option<i64>,
    /// Extracted text; null until the extraction stage runs.
    pub raw_text: Option<String>,
    /// SHA-256 of `raw_text`, change detection only, never identity.
    pub raw_text_hash: Option<String>,
    pub source: DocumentSource,
    pub provider_message_id: Option<String>,
    pub provider_attachment_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub received_at: Option<DateTime<Utc>>,
    /// Brand identification result; null until the brand stage succeeds.
    pub brand: Option<BrandMatch>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request for creating a new document in `collected` state.
#[derive(Debug, Clone)]
pub struct CreateDocumentRequest {
    pub content_hash: String,
    pub source_path: String,
    pub original_filename: String,
    pub stored_filename: String,
    pub mime_type: String,
    pub size_bytes: Option<i64>,
    pub source: DocumentSource,
    pub provider_message_id: Option<String>,
    pub provider_attachment_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub received_at: Option<DateTime<Utc>>,
}

impl CreateDocumentRequest {
    /// Minimal request for a file collected from a directory scan.
    pub fn from_dir(
        content_hash: impl Into<String>,
        source_path: impl Into<String>,
        original_filename: impl Into<String>,
        stored_filename: impl Into<String>,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            source_path: source_path.into(),
            original_filename: original_filename.into(),
            stored_filename: stored_filename.into(),
            mime_type: String::new(),
            size_bytes: None,
            source: DocumentSource::Dir,
            provider_message_id: None,
            provider_attachment_id: None,
            sender: String::new(),
            subject: String::new(),
            received_at: None,
        }
    }
}

/// Selection scope for batch stages.
#[derive(Debug, Clone, Default)]
pub enum DocumentScope {
    /// Every document in the input state.
    #[default]
    All,
    /// Documents created at or after the given instant.
    Since(DateTime<Utc>),
    /// An explicit id list.
    Ids(Vec<Uuid>),
}

// =============================================================================
// LINE TYPES
// =============================================================================

/// One extracted text line of a document. Line order is semantically
/// meaningful; lines are replaced wholesale on re-extraction, never patched.
#[derive(Debug, Clone)]
pub struct Line {
    pub id: Uuid,
    pub document_id: Uuid,
    /// 1-based, unique per document, gap-free in source order.
    pub line_no: i32,
    pub text: String,
    pub embedding: Option<Vector>,
}

/// A line to insert during extraction (before it has an id or embedding).
#[derive(Debug, Clone, PartialEq)]
pub struct NewLine {
    pub line_no: i32,
    pub text: String,
}

/// Split raw text into ordered [`NewLine`]s, preserving empty lines and
/// exact content.
pub fn split_into_lines(raw_text: &str) -> Vec<NewLine> {
    raw_text
        .lines()
        .enumerate()
        .map(|(i, text)| NewLine {
            line_no: (i + 1) as i32,
            text: text.to_string(),
        })
        .collect()
}

// =============================================================================
// BRAND TYPES
// =============================================================================

/// Reference entity for a retail chain/brand. Name unique case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brand {
    pub id: Uuid,
    pub name: String,
    pub website: String,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One `(alias, embedding)` tuple joined with its brand, as consumed by the
/// brand identification stage.
#[derive(Debug, Clone)]
pub struct AliasEmbedding {
    pub brand_id: Uuid,
    pub brand_name: String,
    pub alias: String,
    pub embedding: Vector,
}

/// Brand identification result persisted on the document as jsonb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandMatch {
    pub brand_id: Uuid,
    pub name: String,
    /// Best nearest-neighbor cosine similarity, rounded to 4 decimal places.
    pub score_vec: f64,
    /// Lexical confirmation bonus in [0, 0.3], rounded to 3 decimal places.
    pub regex_bonus: f64,
    /// Final blended score in [0, 1], rounded to 4 decimal places.
    pub score: f64,
    /// The winning alias string.
    pub alias: String,
}

// =============================================================================
// PROCESSING EVENTS
// =============================================================================

/// Pipeline step recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CollectFromDir,
    CollectFromMailbox,
    ExtractText,
    Vectorize,
    IdentifyBrand,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::CollectFromDir => "collect_from_dir",
            Step::CollectFromMailbox => "collect_from_mailbox",
            Step::ExtractText => "extract_text",
            Step::Vectorize => "vectorize",
            Step::IdentifyBrand => "identify_brand",
        }
    }

    pub fn from_str(s: &str) -> Option<Step> {
        match s {
            "collect_from_dir" => Some(Step::CollectFromDir),
            "collect_from_mailbox" => Some(Step::CollectFromMailbox),
            "extract_text" => Some(Step::ExtractText),
            "vectorize" => Some(Step::Vectorize),
            "identify_brand" => Some(Step::IdentifyBrand),
            _ => None,
        }
    }
}

/// Terminal status of a processing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Started,
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::Success => "success",
            EventStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<EventStatus> {
        match s {
            "started" => Some(EventStatus::Started),
            "success" => Some(EventStatus::Success),
            "error" => Some(EventStatus::Error),
            _ => None,
        }
    }
}

/// Append-only audit row for one stage invocation on one document.
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    pub id: Uuid,
    pub document_id: Option<Uuid>,
    pub step: Step,
    pub status: EventStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub message: String,
}

/// Event to append to the audit trail.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub document_id: Option<Uuid>,
    pub step: Step,
    pub status: EventStatus,
    pub duration_ms: Option<i64>,
    pub message: String,
}

impl NewEvent {
    pub fn success(document_id: Uuid, step: Step, duration_ms: i64, message: String) -> Self {
        Self {
            document_id: Some(document_id),
            step,
            status: EventStatus::Success,
            duration_ms: Some(duration_ms),
            message,
        }
    }

    pub fn error(document_id: Uuid, step: Step, message: String) -> Self {
        Self {
            document_id: Some(document_id),
            step,
            status: EventStatus::Error,
            duration_ms: None,
            message,
        }
    }
}

// =============================================================================
// JOB RUNS
// =============================================================================

/// Terminal/running status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<JobStatus> {
        match s {
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            "skipped" => Some(JobStatus::Skipped),
            _ => None,
        }
    }
}

/// Who triggered a pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Cli,
    Admin,
    System,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Cli => "cli",
            TriggeredBy::Admin => "admin",
            TriggeredBy::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<TriggeredBy> {
        match s {
            "cli" => Some(TriggeredBy::Cli),
            "admin" => Some(TriggeredBy::Admin),
            "system" => Some(TriggeredBy::System),
            _ => None,
        }
    }
}

/// One durable row per pipeline invocation (any stage, any trigger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    pub triggered_by: TriggeredBy,
    pub params: JsonValue,
    pub metrics: JsonValue,
    pub log_path: String,
    pub error_message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// Derived run duration; never stored.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|f| (f - self.started_at).num_milliseconds())
    }
}

/// Summary returned to the trigger surface after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub jobrun_id: Uuid,
    pub status: JobStatus,
    pub metrics: JsonValue,
    pub log_path: String,
}

// =============================================================================
// INTAKE OUTCOMES
// =============================================================================

/// Explicit result of processing one intake candidate (file or attachment).
/// Replaces exception-driven duplicate/skip control flow; the caller
/// aggregates these into batch metrics.
#[derive(Debug, Clone)]
pub enum IntakeOutcome {
    Created(Uuid),
    Duplicate,
    Quarantined(QuarantineReason),
    Failed(String),
}

/// Why an intake candidate was quarantined instead of registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineReason {
    DisallowedMime,
    TinyInlineImage,
    TooLarge,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::DisallowedMime => "disallowed_mime",
            QuarantineReason::TinyInlineImage => "tiny_inline_image",
            QuarantineReason::TooLarge => "too_large",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering_is_pipeline_order() {
        assert!(DocState::Collected < DocState::TextExtracted);
        assert!(DocState::TextExtracted < DocState::Vectorized);
        assert!(DocState::Vectorized < DocState::BrandIdentified);
    }

    #[test]
    fn test_state_next_chain() {
        assert_eq!(DocState::Collected.next(), Some(DocState::TextExtracted));
        assert_eq!(DocState::TextExtracted.next(), Some(DocState::Vectorized));
        assert_eq!(DocState::Vectorized.next(), Some(DocState::BrandIdentified));
        assert_eq!(DocState::BrandIdentified.next(), None);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            DocState::Collected,
            DocState::TextExtracted,
            DocState::Vectorized,
            DocState::BrandIdentified,
        ] {
            assert_eq!(DocState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(DocState::from_str("ocr_done"), None);
    }

    #[test]
    fn test_can_advance_only_forward() {
        assert!(DocState::Collected.can_advance_to(DocState::TextExtracted));
        assert!(DocState::Collected.can_advance_to(DocState::BrandIdentified));
        assert!(!DocState::Vectorized.can_advance_to(DocState::Collected));
        assert!(!DocState::Vectorized.can_advance_to(DocState::Vectorized));
    }

    #[test]
    fn test_split_into_lines_preserves_empties_and_order() {
        let lines = split_into_lines("CARREFOUR\n\nTOTAL 12,99\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].line_no, 1);
        assert_eq!(lines[0].text, "CARREFOUR");
        assert_eq!(lines[1].line_no, 2);
        assert_eq!(lines[1].text, "");
        assert_eq!(lines[2].line_no, 3);
        assert_eq!(lines[2].text, "TOTAL 12,99");
    }

    #[test]
    fn test_split_into_lines_handles_crlf() {
        let lines = split_into_lines("a\r\nb");
        assert_eq!(lines[0].text, "a");
        assert_eq!(lines[1].text, "b");
    }

    #[test]
    fn test_split_into_lines_empty_text() {
        assert!(split_into_lines("").is_empty());
    }

    #[test]
    fn test_job_run_duration_derived() {
        let started = Utc::now();
        let run = JobRun {
            id: Uuid::new_v4(),
            job_name: "extract_text".to_string(),
            status: JobStatus::Success,
            triggered_by: TriggeredBy::Cli,
            params: JsonValue::Null,
            metrics: JsonValue::Null,
            log_path: String::new(),
            error_message: String::new(),
            started_at: started,
            finished_at: Some(started + chrono::Duration::milliseconds(1500)),
        };
        assert_eq!(run.duration_ms(), Some(1500));
    }

    #[test]
    fn test_job_run_duration_none_while_running() {
        let run = JobRun {
            id: Uuid::new_v4(),
            job_name: "scan".to_string(),
            status: JobStatus::Running,
            triggered_by: TriggeredBy::System,
            params: JsonValue::Null,
            metrics: JsonValue::Null,
            log_path: String::new(),
            error_message: String::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        assert_eq!(run.duration_ms(), None);
    }

    #[test]
    fn test_brand_match_json_round_trip() {
        let m = BrandMatch {
            brand_id: Uuid::new_v4(),
            name: "Carrefour".to_string(),
            score_vec: 0.92,
            regex_bonus: 0.3,
            score: 0.796,
            alias: "Carrefour".to_string(),
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["score"], 0.796);
        let back: BrandMatch = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_enum_strings_round_trip() {
        for step in [
            Step::CollectFromDir,
            Step::CollectFromMailbox,
            Step::ExtractText,
            Step::Vectorize,
            Step::IdentifyBrand,
        ] {
            assert_eq!(Step::from_str(step.as_str()), Some(step));
        }
        for status in [
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Skipped,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        for t in [TriggeredBy::Cli, TriggeredBy::Admin, TriggeredBy::System] {
            assert_eq!(TriggeredBy::from_str(t.as_str()), Some(t));
        }
    }
}
