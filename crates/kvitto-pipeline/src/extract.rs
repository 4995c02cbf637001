//! Text extraction stage: `collected → text_extracted`.
//!
//! The on-disk file is assumed to already contain raw text (upstream OCR
//! produced it). Extraction reads the bytes, splits them into ordered
//! lines, and applies the result atomically through the registry.

use std::time::Instant;

use tracing::debug;

use kvitto_core::{
    split_into_lines, DocState, DocumentRepository, DocumentScope, EventRepository, NewEvent,
    Result, Step,
};
use kvitto_store::{sha256_bytes, ContentStore, RelPath};

use crate::coordinator::JobContext;

/// Batch metrics of one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractMetrics {
    pub processed: i64,
    pub extracted: i64,
    pub skipped_missing: i64,
    pub errors: i64,
}

/// Text extraction over documents in `collected`.
pub struct ExtractStage<'a> {
    store: &'a ContentStore,
}

impl<'a> ExtractStage<'a> {
    pub fn new(store: &'a ContentStore) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        ctx: &mut JobContext,
        registry: &dyn DocumentRepository,
        events: &dyn EventRepository,
        scope: &DocumentScope,
        dry_run: bool,
    ) -> Result<ExtractMetrics> {
        let mut metrics = ExtractMetrics::default();

        let docs = registry.list_in_state(DocState::Collected, scope).await?;
        ctx.log_info(&format!("extracting text from {} documents", docs.len()));

        for doc in docs {
            metrics.processed += 1;
            ctx.inc_metric("processed", 1).await?;
            let started = Instant::now();

            let rel = match document_rel_path(&doc.source_path, &doc.stored_filename) {
                Ok(rel) => rel,
                Err(e) => {
                    metrics.errors += 1;
                    ctx.inc_metric("errors", 1).await?;
                    events
                        .record(NewEvent::error(doc.id, Step::ExtractText, e.to_string()))
                        .await?;
                    continue;
                }
            };
            let abs = self.store.resolve(&rel)?;

            let bytes = match tokio::fs::read(&abs).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // A prior partial run may have moved or removed the
                    // file; soft skip, never a batch abort.
                    metrics.skipped_missing += 1;
                    ctx.inc_metric("skipped_missing", 1).await?;
                    ctx.log_info(&format!("file missing for document {}: {}", doc.id, rel));
                    continue;
                }
                Err(e) => {
                    // Any other read failure is a per-document error too.
                    metrics.errors += 1;
                    ctx.inc_metric("errors", 1).await?;
                    events
                        .record(NewEvent::error(doc.id, Step::ExtractText, e.to_string()))
                        .await?;
                    ctx.log_error(&format!("cannot read file for {}: {}", doc.id, e));
                    continue;
                }
            };
            let raw_text = String::from_utf8_lossy(&bytes).into_owned();
            let text_hash = sha256_bytes(raw_text.as_bytes());
            let lines = split_into_lines(&raw_text);

            if dry_run {
                metrics.extracted += 1;
                ctx.inc_metric("extracted", 1).await?;
                continue;
            }

            match registry
                .apply_extraction(
                    doc.id,
                    &raw_text,
                    &text_hash,
                    &lines,
                    started.elapsed().as_millis() as i64,
                )
                .await
            {
                Ok(()) => {
                    metrics.extracted += 1;
                    ctx.inc_metric("extracted", 1).await?;
                    debug!(
                        subsystem = "pipeline",
                        component = "extract",
                        document_id = %doc.id,
                        line_count = lines.len(),
                        "text extracted"
                    );
                }
                Err(e) => {
                    metrics.errors += 1;
                    ctx.inc_metric("errors", 1).await?;
                    events
                        .record(NewEvent::error(doc.id, Step::ExtractText, e.to_string()))
                        .await?;
                    ctx.log_error(&format!("extraction failed for {}: {}", doc.id, e));
                }
            }
        }

        ctx.log_info(&format!(
            "extraction finished: processed={} extracted={} skipped_missing={} errors={}",
            metrics.processed, metrics.extracted, metrics.skipped_missing, metrics.errors
        ));
        Ok(metrics)
    }
}

/// Root-relative file path of a document from its directory + filename.
pub(crate) fn document_rel_path(source_path: &str, stored_filename: &str) -> Result<RelPath> {
    if source_path.is_empty() {
        RelPath::normalize(stored_filename)
    } else {
        RelPath::normalize(&format!("{}/{}", source_path, stored_filename))
    }
}
