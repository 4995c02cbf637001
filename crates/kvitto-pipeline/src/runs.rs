//! Job entry points.
//!
//! One function per pipeline job, all following the same coordinated shape:
//! begin (lock, JobRun row, log file), run the stage, then complete or
//! record-and-re-raise the failure. These are the units the trigger surfaces
//! (CLI, scheduler) call.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::error;

use kvitto_core::{
    BrandRepository, DocumentRepository, DocumentScope, EmbeddingBackend, EventRepository,
    MailboxConfig, MailboxProvider, Result, RunSummary, ScanConfig, TriggeredBy,
};
use kvitto_store::{ContentStore, Lockfile};

use crate::brand::IdentifyBrandStage;
use crate::coordinator::{BeginOutcome, JobContext, JobCoordinator};
use crate::extract::ExtractStage;
use crate::mailbox::MailboxCollector;
use crate::scan::DirScanner;
use crate::vectorize::VectorizeStage;

pub const JOB_SCAN_RECEIPTS: &str = "scan_receipts";
pub const JOB_COLLECT_MAILBOX: &str = "collect_mailbox";
pub const JOB_EXTRACT_TEXT: &str = "extract_text";
pub const JOB_VECTORIZE: &str = "vectorize";
pub const JOB_IDENTIFY_BRAND: &str = "identify_brand";

/// Close out a run: success completes it, failure is recorded on the JobRun
/// row and then re-raised to the caller. The stage error is what the caller
/// sees even when the bookkeeping write itself fails.
async fn settle<T>(ctx: JobContext, outcome: Result<T>) -> Result<RunSummary> {
    match outcome {
        Ok(_) => ctx.complete().await,
        Err(e) => {
            if let Err(record_err) = ctx.fail(&e).await {
                error!(
                    subsystem = "pipeline",
                    error = %record_err,
                    "could not record job failure: {}",
                    e
                );
            }
            Err(e)
        }
    }
}

/// Scan the incoming directory for receipt files and register them.
pub async fn run_dir_scan(
    coordinator: &JobCoordinator,
    store: &ContentStore,
    config: &ScanConfig,
    registry: &dyn DocumentRepository,
    events: &dyn EventRepository,
    triggered_by: TriggeredBy,
    dry_run: bool,
) -> Result<RunSummary> {
    let params = json!({ "pattern": config.pattern, "dry_run": dry_run });
    let mut ctx = match coordinator
        .begin(JOB_SCAN_RECEIPTS, params, triggered_by, true)
        .await?
    {
        BeginOutcome::Started(ctx) => ctx,
        BeginOutcome::Skipped(summary) => return Ok(summary),
    };

    let scanner = DirScanner::new(store, config);
    let outcome = scanner.run(&mut ctx, registry, events, dry_run).await;
    settle(ctx, outcome).await
}

/// Collect receipt attachments from the mailbox.
///
/// Guarded twice: a filesystem lockfile (checked before any row is written,
/// the historical guard for this job) and the usual advisory lock. Either
/// being busy records a `skipped` run.
pub async fn run_mailbox_collect(
    coordinator: &JobCoordinator,
    provider: &dyn MailboxProvider,
    store: &ContentStore,
    config: &MailboxConfig,
    registry: &dyn DocumentRepository,
    events: &dyn EventRepository,
    since: Option<DateTime<Utc>>,
    triggered_by: TriggeredBy,
    dry_run: bool,
) -> Result<RunSummary> {
    let params = json!({ "query": config.query, "since": since, "dry_run": dry_run });

    let lock_path = coordinator.layout().lockfile_path(JOB_COLLECT_MAILBOX);
    let _lockfile = match Lockfile::acquire(&lock_path)? {
        Some(lockfile) => lockfile,
        None => {
            return coordinator
                .record_skipped(JOB_COLLECT_MAILBOX, params, triggered_by)
                .await;
        }
    };

    let mut ctx = match coordinator
        .begin(JOB_COLLECT_MAILBOX, params, triggered_by, true)
        .await?
    {
        BeginOutcome::Started(ctx) => ctx,
        BeginOutcome::Skipped(summary) => return Ok(summary),
    };

    let collector = MailboxCollector::new(provider, store, config);
    let outcome = collector
        .run(&mut ctx, registry, events, since, dry_run)
        .await;
    settle(ctx, outcome).await
}

/// Extract text from collected documents.
pub async fn run_extract_text(
    coordinator: &JobCoordinator,
    store: &ContentStore,
    registry: &dyn DocumentRepository,
    events: &dyn EventRepository,
    scope: &DocumentScope,
    triggered_by: TriggeredBy,
    dry_run: bool,
) -> Result<RunSummary> {
    let params = json!({ "dry_run": dry_run });
    let mut ctx = match coordinator
        .begin(JOB_EXTRACT_TEXT, params, triggered_by, true)
        .await?
    {
        BeginOutcome::Started(ctx) => ctx,
        BeginOutcome::Skipped(summary) => return Ok(summary),
    };

    let stage = ExtractStage::new(store);
    let outcome = stage.run(&mut ctx, registry, events, scope, dry_run).await;
    settle(ctx, outcome).await
}

/// Embed the lines of text-extracted documents.
pub async fn run_vectorize(
    coordinator: &JobCoordinator,
    backend: &dyn EmbeddingBackend,
    registry: &dyn DocumentRepository,
    events: &dyn EventRepository,
    scope: &DocumentScope,
    triggered_by: TriggeredBy,
    dry_run: bool,
) -> Result<RunSummary> {
    let params = json!({ "dry_run": dry_run });
    let mut ctx = match coordinator
        .begin(JOB_VECTORIZE, params, triggered_by, true)
        .await?
    {
        BeginOutcome::Started(ctx) => ctx,
        BeginOutcome::Skipped(summary) => return Ok(summary),
    };

    let stage = VectorizeStage::new(backend);
    let outcome = stage.run(&mut ctx, registry, events, scope, dry_run).await;
    settle(ctx, outcome).await
}

/// Identify brands on vectorized documents.
pub async fn run_identify_brand(
    coordinator: &JobCoordinator,
    registry: &dyn DocumentRepository,
    brands: &dyn BrandRepository,
    events: &dyn EventRepository,
    scope: &DocumentScope,
    triggered_by: TriggeredBy,
    dry_run: bool,
) -> Result<RunSummary> {
    let params = json!({ "dry_run": dry_run });
    let mut ctx = match coordinator
        .begin(JOB_IDENTIFY_BRAND, params, triggered_by, true)
        .await?
    {
        BeginOutcome::Started(ctx) => ctx,
        BeginOutcome::Skipped(summary) => return Ok(summary),
    };

    let stage = IdentifyBrandStage;
    let outcome = stage
        .run(&mut ctx, registry, brands, events, scope, dry_run)
        .await;
    settle(ctx, outcome).await
}
