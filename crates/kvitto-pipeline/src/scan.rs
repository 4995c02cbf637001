//! Directory intake adapter.
//!
//! Walks an intake directory under the storage root, hashes every matching
//! file, relocates new files into the dated bucket, and registers them as
//! `collected` documents. Per-file failures are counted and logged; they
//! never abort the batch.

use chrono::Utc;
use glob::Pattern;
use tracing::{debug, warn};
use walkdir::WalkDir;

use kvitto_core::{
    CreateDocumentRequest, DocumentRepository, Error, EventRepository, NewEvent, Result,
    ScanConfig, Step,
};
use kvitto_store::{sha256_file, ContentStore, RelPath};

use crate::coordinator::JobContext;

/// Batch metrics of one scanner run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanMetrics {
    pub scanned: i64,
    pub created: i64,
    pub duplicates: i64,
    pub moved: i64,
    pub errors: i64,
}

/// Directory scanner over `root/<subdir>`.
pub struct DirScanner<'a> {
    store: &'a ContentStore,
    config: &'a ScanConfig,
}

impl<'a> DirScanner<'a> {
    pub fn new(store: &'a ContentStore, config: &'a ScanConfig) -> Self {
        Self { store, config }
    }

    /// Run one scan batch.
    ///
    /// `dry_run` hashes and classifies without moving files or writing rows.
    pub async fn run(
        &self,
        ctx: &mut JobContext,
        registry: &dyn DocumentRepository,
        events: &dyn EventRepository,
        dry_run: bool,
    ) -> Result<ScanMetrics> {
        let started = std::time::Instant::now();
        let mut metrics = ScanMetrics::default();

        let (candidates, walk_errors) = self.enumerate()?;
        if walk_errors > 0 {
            metrics.errors += walk_errors;
            ctx.inc_metric("errors", walk_errors).await?;
            ctx.log_error(&format!("{} unreadable entries skipped during walk", walk_errors));
        }
        ctx.log_info(&format!(
            "scanning {}/{} ({} candidate files, pattern {:?})",
            self.store.layout().root().display(),
            self.config.subdir,
            candidates.len(),
            self.config.pattern
        ));

        for rel in candidates {
            metrics.scanned += 1;
            ctx.inc_metric("scanned", 1).await?;

            match self.process_file(registry, events, &rel, dry_run).await {
                Ok(FileOutcome::Created { moved }) => {
                    metrics.created += 1;
                    ctx.inc_metric("created", 1).await?;
                    if moved {
                        metrics.moved += 1;
                        ctx.inc_metric("moved", 1).await?;
                    }
                }
                Ok(FileOutcome::Duplicate) => {
                    metrics.duplicates += 1;
                    ctx.inc_metric("duplicates", 1).await?;
                    debug!(
                        subsystem = "pipeline",
                        component = "dir_scanner",
                        file = %rel,
                        "duplicate content, skipped"
                    );
                }
                Err(e) => {
                    metrics.errors += 1;
                    ctx.inc_metric("errors", 1).await?;
                    ctx.log_error(&format!("failed to ingest {}: {}", rel, e));
                }
            }
        }

        ctx.set_metric(
            "duration_seconds",
            serde_json::json!(started.elapsed().as_secs_f64()),
        )
        .await?;
        ctx.log_info(&format!(
            "scan finished: scanned={} created={} duplicates={} moved={} errors={}",
            metrics.scanned, metrics.created, metrics.duplicates, metrics.moved, metrics.errors
        ));
        Ok(metrics)
    }

    /// Deterministic candidate list: root-relative paths, lexicographic.
    ///
    /// Returns the candidates plus the number of entries the walk could not
    /// read; those subtrees are skipped, not fatal.
    fn enumerate(&self) -> Result<(Vec<RelPath>, i64)> {
        let root = self.store.layout().root().to_path_buf();
        let base = root.join(&self.config.subdir);
        if !base.is_dir() {
            return Ok((Vec::new(), 0));
        }

        let pattern = Pattern::new(&self.config.pattern)
            .map_err(|e| Error::Config(format!("bad scan pattern {:?}: {}", self.config.pattern, e)))?;

        let max_depth = if self.config.recursive { usize::MAX } else { 1 };
        let mut out = Vec::new();
        let mut walk_errors = 0i64;
        for entry in WalkDir::new(&base).max_depth(max_depth) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    walk_errors += 1;
                    warn!(
                        subsystem = "pipeline",
                        component = "dir_scanner",
                        error = %e,
                        "skipping unreadable entry"
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !pattern.matches(&name) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .map_err(|_| Error::PathEscape(entry.path().display().to_string()))?;
            out.push(RelPath::normalize(&rel.to_string_lossy())?);
        }
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok((out, walk_errors))
    }

    async fn process_file(
        &self,
        registry: &dyn DocumentRepository,
        events: &dyn EventRepository,
        rel: &RelPath,
        dry_run: bool,
    ) -> Result<FileOutcome> {
        let abs = self.store.resolve(rel)?;
        let digest = sha256_file(&abs).await?;

        // Fast path only; the insert constraint is the real authority.
        if registry.find_by_hash(&digest).await?.is_some() {
            return Ok(FileOutcome::Duplicate);
        }

        if dry_run {
            return Ok(FileOutcome::Created { moved: false });
        }

        // Move before insert: a crash between the two leaves a file in the
        // bucket and no row, which the next run repairs by re-hashing it.
        let move_result = self
            .store
            .move_into_bucket(rel, Utc::now().date_naive(), &digest, true)
            .await?;
        let dst_abs = self.store.resolve(&move_result.dst_rel)?;
        let (size_bytes, mime_type) = self.store.stat_file(&dst_abs).await?;

        let mut req = CreateDocumentRequest::from_dir(
            digest,
            move_result.dst_rel.parent(),
            rel.file_name(),
            move_result.dst_rel.file_name(),
        );
        req.mime_type = mime_type;
        req.size_bytes = Some(size_bytes);

        match registry.create_collected(req).await {
            Ok(doc) => {
                // The document is registered at this point; a failed event
                // write must not demote it to an ingest error.
                if let Err(e) = events
                    .record(NewEvent::success(
                        doc.id,
                        Step::CollectFromDir,
                        0,
                        format!("collected {}", move_result.dst_rel),
                    ))
                    .await
                {
                    warn!(
                        subsystem = "pipeline",
                        component = "dir_scanner",
                        document_id = %doc.id,
                        error = %e,
                        "collect event write failed"
                    );
                }
                Ok(FileOutcome::Created {
                    moved: move_result.moved,
                })
            }
            // Lost race with a concurrent run: the constraint caught it.
            Err(e) if e.is_duplicate() => Ok(FileOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }
}

enum FileOutcome {
    Created { moved: bool },
    Duplicate,
}
