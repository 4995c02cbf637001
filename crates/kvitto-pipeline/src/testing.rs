//! In-memory trait implementations for adapter and stage tests.
//!
//! These mirror the PostgreSQL repositories' observable semantics (dedup
//! constraints, guarded transitions) closely enough that the adapters and
//! stages can be exercised without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use kvitto_core::{
    AliasEmbedding, Brand, BrandMatch, BrandRepository, CreateBrandRequest,
    CreateDocumentRequest, DocState, Document, DocumentRepository, DocumentScope, EmbeddingBackend,
    Error, EventRepository, JobRun, JobRunRepository, JobStatus, Line, MailMessage,
    MailboxProvider, MessageDisposition, NewEvent, NewJobRun, NewLine, ProcessingEvent, Result,
};

// =============================================================================
// DOCUMENT REGISTRY
// =============================================================================

/// In-memory [`DocumentRepository`] with the same dedup and guard semantics
/// as the PostgreSQL implementation.
#[derive(Default)]
pub struct MemoryRegistry {
    docs: Mutex<Vec<Document>>,
    lines: Mutex<HashMap<Uuid, Vec<Line>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.docs.lock().unwrap().len()
    }
}

#[async_trait]
impl DocumentRepository for MemoryRegistry {
    async fn create_collected(&self, req: CreateDocumentRequest) -> Result<Document> {
        let mut docs = self.docs.lock().unwrap();
        if docs.iter().any(|d| d.content_hash == req.content_hash) {
            return Err(Error::DuplicateContent(req.content_hash));
        }
        if let Some(att) = &req.provider_attachment_id {
            if docs
                .iter()
                .any(|d| d.provider_attachment_id.as_deref() == Some(att))
            {
                return Err(Error::DuplicateContent(req.content_hash));
            }
        }
        let now = Utc::now();
        let doc = Document {
            id: Uuid::now_v7(),
            state: DocState::Collected,
            content_hash: req.content_hash,
            source_path: req.source_path,
            original_filename: req.original_filename,
            stored_filename: req.stored_filename,
            mime_type: req.mime_type,
            size_bytes: req.size_bytes,
            raw_text: None,
            raw_text_hash: None,
            source: req.source,
            provider_message_id: req.provider_message_id,
            provider_attachment_id: req.provider_attachment_id,
            sender: req.sender,
            subject: req.subject,
            received_at: req.received_at,
            brand: None,
            created_at: now,
            updated_at: now,
        };
        docs.push(doc.clone());
        Ok(doc)
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let docs = self.docs.lock().unwrap();
        Ok(docs.iter().find(|d| d.content_hash == content_hash).cloned())
    }

    async fn find_by_attachment_ref(
        &self,
        provider_attachment_id: &str,
    ) -> Result<Option<Document>> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .iter()
            .find(|d| d.provider_attachment_id.as_deref() == Some(provider_attachment_id))
            .cloned())
    }

    async fn get(&self, id: Uuid) -> Result<Document> {
        let docs = self.docs.lock().unwrap();
        docs.iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(Error::DocumentNotFound(id))
    }

    async fn list_in_state(
        &self,
        state: DocState,
        scope: &DocumentScope,
    ) -> Result<Vec<Document>> {
        let docs = self.docs.lock().unwrap();
        let mut out: Vec<Document> = docs
            .iter()
            .filter(|d| d.state == state)
            .filter(|d| match scope {
                DocumentScope::All => true,
                DocumentScope::Since(ts) => d.created_at >= *ts,
                DocumentScope::Ids(ids) => ids.contains(&d.id),
            })
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        Ok(out)
    }

    async fn transition(&self, id: Uuid, from_expected: DocState, to: DocState) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .iter_mut()
            .find(|d| d.id == id && d.state == from_expected)
            .ok_or(Error::InvalidTransition {
                id,
                expected: from_expected,
                to,
            })?;
        doc.state = to;
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_to_collected(&self, id: Uuid) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(Error::DocumentNotFound(id))?;
        doc.state = DocState::Collected;
        doc.raw_text = None;
        doc.raw_text_hash = None;
        doc.brand = None;
        doc.updated_at = Utc::now();
        self.lines.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn update_location(
        &self,
        id: Uuid,
        source_path: &str,
        stored_filename: &str,
    ) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(Error::DocumentNotFound(id))?;
        doc.source_path = source_path.to_string();
        doc.stored_filename = stored_filename.to_string();
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_extraction(
        &self,
        id: Uuid,
        raw_text: &str,
        raw_text_hash: &str,
        lines: &[NewLine],
        _duration_ms: i64,
    ) -> Result<()> {
        {
            let mut docs = self.docs.lock().unwrap();
            let doc = docs
                .iter_mut()
                .find(|d| d.id == id && d.state == DocState::Collected)
                .ok_or(Error::InvalidTransition {
                    id,
                    expected: DocState::Collected,
                    to: DocState::TextExtracted,
                })?;
            doc.raw_text = Some(raw_text.to_string());
            doc.raw_text_hash = Some(raw_text_hash.to_string());
            doc.state = DocState::TextExtracted;
            doc.updated_at = Utc::now();
        }
        let stored: Vec<Line> = lines
            .iter()
            .map(|l| Line {
                id: Uuid::now_v7(),
                document_id: id,
                line_no: l.line_no,
                text: l.text.clone(),
                embedding: None,
            })
            .collect();
        self.lines.lock().unwrap().insert(id, stored);
        Ok(())
    }

    async fn lines(&self, document_id: Uuid) -> Result<Vec<Line>> {
        let lines = self.lines.lock().unwrap();
        Ok(lines.get(&document_id).cloned().unwrap_or_default())
    }

    async fn embedded_lines(&self, document_id: Uuid) -> Result<Vec<Line>> {
        let lines = self.lines.lock().unwrap();
        Ok(lines
            .get(&document_id)
            .map(|ls| {
                ls.iter()
                    .filter(|l| l.embedding.is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_line_embeddings(
        &self,
        document_id: Uuid,
        embeddings: &[(i32, Vector)],
    ) -> Result<()> {
        let mut lines = self.lines.lock().unwrap();
        if let Some(ls) = lines.get_mut(&document_id) {
            for (line_no, embedding) in embeddings {
                if let Some(line) = ls.iter_mut().find(|l| l.line_no == *line_no) {
                    line.embedding = Some(embedding.clone());
                }
            }
        }
        Ok(())
    }

    async fn set_brand(&self, id: Uuid, brand: &BrandMatch, _duration_ms: i64) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .iter_mut()
            .find(|d| d.id == id && d.state == DocState::Vectorized)
            .ok_or(Error::InvalidTransition {
                id,
                expected: DocState::Vectorized,
                to: DocState::BrandIdentified,
            })?;
        doc.brand = Some(brand.clone());
        doc.state = DocState::BrandIdentified;
        doc.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// BRANDS
// =============================================================================

/// In-memory [`BrandRepository`].
#[derive(Default)]
pub struct MemoryBrands {
    brands: Mutex<Vec<Brand>>,
    aliases: Mutex<Vec<AliasEmbedding>>,
}

impl MemoryBrands {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrandRepository for MemoryBrands {
    async fn create(&self, req: CreateBrandRequest) -> Result<Brand> {
        let mut brands = self.brands.lock().unwrap();
        if brands
            .iter()
            .any(|b| b.name.eq_ignore_ascii_case(&req.name))
        {
            return Err(Error::DuplicateContent(format!(
                "brand name '{}' already exists",
                req.name
            )));
        }
        let now = Utc::now();
        let brand = Brand {
            id: Uuid::now_v7(),
            name: req.name,
            website: req.website,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        brands.push(brand.clone());
        Ok(brand)
    }

    async fn get(&self, id: Uuid) -> Result<Brand> {
        let brands = self.brands.lock().unwrap();
        brands
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Brand {} not found", id)))
    }

    async fn set_alias_embedding(
        &self,
        brand_id: Uuid,
        alias: &str,
        embedding: &Vector,
    ) -> Result<()> {
        let brand_name = self.get(brand_id).await?.name;
        let mut aliases = self.aliases.lock().unwrap();
        if let Some(existing) = aliases
            .iter_mut()
            .find(|a| a.brand_id == brand_id && a.alias == alias)
        {
            existing.embedding = embedding.clone();
        } else {
            aliases.push(AliasEmbedding {
                brand_id,
                brand_name,
                alias: alias.to_string(),
                embedding: embedding.clone(),
            });
        }
        Ok(())
    }

    async fn alias_embeddings(&self) -> Result<Vec<AliasEmbedding>> {
        let mut out = self.aliases.lock().unwrap().clone();
        out.sort_by(|a, b| (a.brand_name.as_str(), a.alias.as_str())
            .cmp(&(b.brand_name.as_str(), b.alias.as_str())));
        Ok(out)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// In-memory append-only [`EventRepository`].
#[derive(Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<ProcessingEvent>>,
    pub fail_record: bool,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `record` call errors, simulating an unavailable event store.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_record: true,
        }
    }

    pub fn all(&self) -> Vec<ProcessingEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventRepository for MemoryEvents {
    async fn record(&self, event: NewEvent) -> Result<Uuid> {
        if self.fail_record {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        let id = Uuid::now_v7();
        let now = Utc::now();
        self.events.lock().unwrap().push(ProcessingEvent {
            id,
            document_id: event.document_id,
            step: event.step,
            status: event.status,
            started_at: now,
            finished_at: Some(now),
            duration_ms: event.duration_ms,
            message: event.message,
        });
        Ok(id)
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<ProcessingEvent>> {
        let events = self.events.lock().unwrap();
        Ok(events
            .iter()
            .filter(|e| e.document_id == Some(document_id))
            .cloned()
            .collect())
    }
}

// =============================================================================
// JOB RUNS
// =============================================================================

/// In-memory [`JobRunRepository`] with the running-exactly-once guard.
#[derive(Default)]
pub struct MemoryJobRuns {
    runs: Mutex<Vec<JobRun>>,
    pub fail_finish: bool,
}

impl MemoryJobRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// `finish` errors while the rest of the repository works, simulating a
    /// bookkeeping write that fails at run close.
    pub fn failing_finish() -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            fail_finish: true,
        }
    }

    pub fn all(&self) -> Vec<JobRun> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunRepository for MemoryJobRuns {
    async fn create(&self, req: NewJobRun) -> Result<JobRun> {
        let now = Utc::now();
        let run = JobRun {
            id: Uuid::now_v7(),
            job_name: req.job_name,
            status: req.status,
            triggered_by: req.triggered_by,
            params: req.params,
            metrics: serde_json::json!({}),
            log_path: req.log_path,
            error_message: String::new(),
            started_at: now,
            finished_at: if matches!(req.status, JobStatus::Running) {
                None
            } else {
                Some(now)
            },
        };
        self.runs.lock().unwrap().push(run.clone());
        Ok(run)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        if self.fail_finish {
            return Err(Error::Database(sqlx::Error::PoolClosed));
        }
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .iter_mut()
            .find(|r| r.id == id && r.status == JobStatus::Running)
            .ok_or_else(|| Error::Job(format!("job run {} is not in running state", id)))?;
        run.status = status;
        run.error_message = error_message.unwrap_or("").to_string();
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn set_metric(&self, id: Uuid, key: &str, value: JsonValue) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("Job run {} not found", id)))?;
        run.metrics[key] = value;
        Ok(())
    }

    async fn inc_metric(&self, id: Uuid, key: &str, by: i64) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("Job run {} not found", id)))?;
        let current = run.metrics[key].as_i64().unwrap_or(0);
        run.metrics[key] = serde_json::json!(current + by);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<JobRun> {
        let runs = self.runs.lock().unwrap();
        runs.iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Job run {} not found", id)))
    }
}

// =============================================================================
// MAILBOX
// =============================================================================

/// Scripted [`MailboxProvider`] for collector tests.
#[derive(Default)]
pub struct MockMailbox {
    messages: Vec<MailMessage>,
    payloads: HashMap<(String, String), Vec<u8>>,
    pub fail_mark_processed: bool,
    processed: Mutex<Vec<(String, MessageDisposition)>>,
}

impl MockMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message together with its attachment payloads, in attachment
    /// order.
    pub fn with_message(mut self, message: MailMessage, payloads: Vec<Vec<u8>>) -> Self {
        for (att, bytes) in message.attachments.iter().zip(payloads) {
            self.payloads
                .insert((message.id.clone(), att.id.clone()), bytes);
        }
        self.messages.push(message);
        self
    }

    pub fn processed(&self) -> Vec<(String, MessageDisposition)> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailboxProvider for MockMailbox {
    async fn list_messages(
        &self,
        _query: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MailMessage>> {
        Ok(self
            .messages
            .iter()
            .filter(|m| match (since, m.received_at) {
                (Some(since), Some(received)) => received >= since,
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn fetch_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        self.payloads
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::Mailbox(format!(
                    "no payload for attachment {} of message {}",
                    attachment_id, message_id
                ))
            })
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        disposition: MessageDisposition,
    ) -> Result<()> {
        if self.fail_mark_processed {
            return Err(Error::Mailbox("label mutation unavailable".to_string()));
        }
        self.processed
            .lock()
            .unwrap()
            .push((message_id.to_string(), disposition));
        Ok(())
    }
}

// =============================================================================
// EMBEDDINGS
// =============================================================================

/// Deterministic [`EmbeddingBackend`]: optional per-text overrides, with a
/// byte-derived unit vector as the default.
#[derive(Default)]
pub struct MockEmbedder {
    pub overrides: HashMap<String, Vec<f32>>,
    pub fail: bool,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.overrides.insert(text.to_string(), vector);
        self
    }

    pub fn failing() -> Self {
        Self {
            overrides: HashMap::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if self.fail {
            return Err(Error::Embedding("backend unavailable".to_string()));
        }
        Ok(texts
            .iter()
            .map(|t| {
                Vector::from(
                    self.overrides
                        .get(t)
                        .cloned()
                        .unwrap_or_else(|| default_vector(t)),
                )
            })
            .collect())
    }
}

/// Two-dimensional unit vector derived from the text bytes; stable across
/// runs, distinct for most inputs.
fn default_vector(text: &str) -> Vec<f32> {
    let sum: u32 = text.bytes().map(u32::from).sum();
    let angle = ((sum % 360) as f32).to_radians();
    vec![angle.cos(), angle.sin()]
}
