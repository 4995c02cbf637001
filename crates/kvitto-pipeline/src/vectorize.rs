//! Vectorization stage: `text_extracted → vectorized`.
//!
//! Non-empty lines are embedded in one batch per document through the
//! opaque [`EmbeddingBackend`]; a backend failure is a per-document error,
//! never a batch abort.

use std::time::Instant;

use tracing::debug;

use kvitto_core::{
    DocState, DocumentRepository, DocumentScope, EmbeddingBackend, EventRepository, NewEvent,
    Result, Step,
};

use crate::coordinator::JobContext;

/// Batch metrics of one vectorization run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorizeMetrics {
    pub processed: i64,
    pub vectorized: i64,
    pub lines_embedded: i64,
    pub errors: i64,
}

/// Vectorization over documents in `text_extracted`.
pub struct VectorizeStage<'a> {
    backend: &'a dyn EmbeddingBackend,
}

impl<'a> VectorizeStage<'a> {
    pub fn new(backend: &'a dyn EmbeddingBackend) -> Self {
        Self { backend }
    }

    pub async fn run(
        &self,
        ctx: &mut JobContext,
        registry: &dyn DocumentRepository,
        events: &dyn EventRepository,
        scope: &DocumentScope,
        dry_run: bool,
    ) -> Result<VectorizeMetrics> {
        let mut metrics = VectorizeMetrics::default();

        let docs = registry
            .list_in_state(DocState::TextExtracted, scope)
            .await?;
        ctx.log_info(&format!("vectorizing {} documents", docs.len()));

        for doc in docs {
            metrics.processed += 1;
            ctx.inc_metric("processed", 1).await?;
            let started = Instant::now();

            match self.vectorize_document(registry, doc.id, dry_run).await {
                Ok(embedded) => {
                    metrics.vectorized += 1;
                    metrics.lines_embedded += embedded;
                    ctx.inc_metric("vectorized", 1).await?;
                    ctx.inc_metric("lines_embedded", embedded).await?;
                    if !dry_run {
                        events
                            .record(NewEvent::success(
                                doc.id,
                                Step::Vectorize,
                                started.elapsed().as_millis() as i64,
                                format!("embedded {} lines", embedded),
                            ))
                            .await?;
                    }
                    debug!(
                        subsystem = "pipeline",
                        component = "vectorize",
                        document_id = %doc.id,
                        line_count = embedded,
                        "document vectorized"
                    );
                }
                Err(e) => {
                    metrics.errors += 1;
                    ctx.inc_metric("errors", 1).await?;
                    events
                        .record(NewEvent::error(doc.id, Step::Vectorize, e.to_string()))
                        .await?;
                    ctx.log_error(&format!("vectorization failed for {}: {}", doc.id, e));
                }
            }
        }

        ctx.log_info(&format!(
            "vectorization finished: processed={} vectorized={} lines_embedded={} errors={}",
            metrics.processed, metrics.vectorized, metrics.lines_embedded, metrics.errors
        ));
        Ok(metrics)
    }

    /// Embed one document's non-empty lines and advance its state.
    /// Returns the number of lines embedded.
    async fn vectorize_document(
        &self,
        registry: &dyn DocumentRepository,
        id: uuid::Uuid,
        dry_run: bool,
    ) -> Result<i64> {
        let lines = registry.lines(id).await?;
        let targets: Vec<_> = lines
            .iter()
            .filter(|l| !l.text.trim().is_empty())
            .collect();

        if dry_run {
            return Ok(targets.len() as i64);
        }

        if !targets.is_empty() {
            let texts: Vec<String> = targets.iter().map(|l| l.text.clone()).collect();
            let vectors = self.backend.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(kvitto_core::Error::Embedding(format!(
                    "backend returned {} vectors for {} inputs",
                    vectors.len(),
                    texts.len()
                )));
            }
            let pairs: Vec<(i32, pgvector::Vector)> = targets
                .iter()
                .map(|l| l.line_no)
                .zip(vectors.into_iter())
                .collect();
            registry.set_line_embeddings(id, &pairs).await?;
        }

        registry
            .transition(id, DocState::TextExtracted, DocState::Vectorized)
            .await?;
        Ok(targets.len() as i64)
    }
}
