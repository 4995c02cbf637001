//! Mailbox intake adapter.
//!
//! Enumerates candidate messages from an opaque [`MailboxProvider`], applies
//! a fixed-order decision policy per attachment, and registers accepted
//! receipts with mailbox provenance. Decisions can be mirrored as one JSON
//! line each into the job's `.jsonl` log.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use kvitto_core::{
    CreateDocumentRequest, DocumentRepository, DocumentSource, EventRepository, IntakeOutcome,
    MailAttachment, MailMessage, MailboxConfig, MailboxProvider, MessageDisposition, NewEvent,
    QuarantineReason, Result, Step,
};
use kvitto_store::{sha256_bytes, ContentStore};

use crate::coordinator::JobContext;

/// Batch metrics of one collector run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxMetrics {
    pub emails_scanned: i64,
    pub attachments_seen: i64,
    pub attachments_downloaded: i64,
    pub receipts_created: i64,
    pub duplicates_skipped: i64,
    pub quarantined: i64,
    pub errors: i64,
}

/// Policy decision for one attachment, before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Rejected by MIME allow-list; bytes are fetched so the sample can be
    /// written to the quarantine area.
    Quarantine(QuarantineReason),
    /// Passed classification; dedup checks and download follow.
    Accept,
}

/// Classification steps 1-3 of the decision policy, in fixed order. Pure:
/// no registry lookups, no downloads.
pub fn classify(att: &MailAttachment, config: &MailboxConfig) -> Decision {
    let allowed = config.allowed_mime_types.is_empty()
        || config
            .allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&att.mime_type));
    if !allowed {
        return Decision::Quarantine(QuarantineReason::DisallowedMime);
    }
    if att.inline
        && att.mime_type.to_ascii_lowercase().starts_with("image/")
        && att.size_bytes < config.min_image_bytes
    {
        return Decision::Quarantine(QuarantineReason::TinyInlineImage);
    }
    if att.size_bytes > config.max_size_bytes {
        return Decision::Quarantine(QuarantineReason::TooLarge);
    }
    Decision::Accept
}

/// Whether a sender matches the blacklist (case-insensitive substring).
pub fn sender_blacklisted(sender: &str, blacklist: &[String]) -> bool {
    let sender = sender.to_lowercase();
    blacklist
        .iter()
        .any(|b| !b.is_empty() && sender.contains(&b.to_lowercase()))
}

/// Mailbox collector over a provider and the content store.
pub struct MailboxCollector<'a> {
    provider: &'a dyn MailboxProvider,
    store: &'a ContentStore,
    config: &'a MailboxConfig,
}

impl<'a> MailboxCollector<'a> {
    pub fn new(
        provider: &'a dyn MailboxProvider,
        store: &'a ContentStore,
        config: &'a MailboxConfig,
    ) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Run one collection batch.
    pub async fn run(
        &self,
        ctx: &mut JobContext,
        registry: &dyn DocumentRepository,
        events: &dyn EventRepository,
        since: Option<DateTime<Utc>>,
        dry_run: bool,
    ) -> Result<MailboxMetrics> {
        let mut metrics = MailboxMetrics::default();
        let mut decisions = self.open_decision_log(ctx)?;

        // Budget counts byte fetches, not attachments seen.
        let mut budget = self.config.max_attachments;

        let messages = self
            .provider
            .list_messages(&self.config.query, since)
            .await?;
        ctx.log_info(&format!(
            "collecting from mailbox: {} candidate messages",
            messages.len()
        ));

        'messages: for message in &messages {
            metrics.emails_scanned += 1;
            ctx.inc_metric("emails_scanned", 1).await?;

            if sender_blacklisted(&message.sender, &self.config.blacklist_senders) {
                ctx.log_info(&format!(
                    "skipping blacklisted sender {}",
                    message.sender
                ));
                continue;
            }

            let mut created_any = false;
            let mut quarantined_any = false;

            for att in &message.attachments {
                if budget <= 0 {
                    ctx.log_info("attachment budget exhausted, stopping");
                    break 'messages;
                }
                metrics.attachments_seen += 1;
                ctx.inc_metric("attachments_seen", 1).await?;

                let outcome = self
                    .process_attachment(
                        registry, events, message, att, &mut budget, &mut metrics, dry_run,
                    )
                    .await;

                let (label, detail) = match &outcome {
                    Ok(IntakeOutcome::Created(id)) => {
                        created_any = true;
                        ("created", id.to_string())
                    }
                    Ok(IntakeOutcome::Duplicate) => ("duplicate", String::new()),
                    Ok(IntakeOutcome::Quarantined(reason)) => {
                        quarantined_any = true;
                        ("quarantined", reason.as_str().to_string())
                    }
                    Ok(IntakeOutcome::Failed(msg)) => ("failed", msg.clone()),
                    Err(e) => ("failed", e.to_string()),
                };
                if let Some(log) = decisions.as_mut() {
                    log.record(json!({
                        "message_id": message.id,
                        "attachment_id": att.id,
                        "filename": att.filename,
                        "mime_type": att.mime_type,
                        "size_bytes": att.size_bytes,
                        "decision": label,
                        "detail": detail,
                    }));
                }

                match outcome {
                    Ok(IntakeOutcome::Failed(msg)) => {
                        metrics.errors += 1;
                        ctx.inc_metric("errors", 1).await?;
                        ctx.log_error(&format!(
                            "attachment {} of {} failed: {}",
                            att.id, message.id, msg
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Environment fault: batch continues, error counted.
                        metrics.errors += 1;
                        ctx.inc_metric("errors", 1).await?;
                        ctx.log_error(&format!(
                            "attachment {} of {} failed: {}",
                            att.id, message.id, e
                        ));
                    }
                }
            }

            // Label mutation is strictly after persistence and best-effort:
            // a failure never invalidates created documents.
            if !dry_run && self.config.mark_processed && (created_any || quarantined_any) {
                let disposition = if created_any {
                    MessageDisposition::Imported
                } else {
                    MessageDisposition::Quarantined
                };
                if let Err(e) = self.provider.mark_processed(&message.id, disposition).await {
                    metrics.errors += 1;
                    ctx.inc_metric("errors", 1).await?;
                    ctx.log_error(&format!(
                        "label mutation failed for message {}: {}",
                        message.id, e
                    ));
                }
            }
        }

        for (key, value) in [
            ("emails_scanned", metrics.emails_scanned),
            ("attachments_seen", metrics.attachments_seen),
            ("attachments_downloaded", metrics.attachments_downloaded),
            ("receipts_created", metrics.receipts_created),
            ("duplicates_skipped", metrics.duplicates_skipped),
            ("quarantined", metrics.quarantined),
            ("errors", metrics.errors),
        ] {
            ctx.set_metric(key, json!(value)).await?;
        }
        ctx.log_info(&format!(
            "collect finished: scanned={} seen={} downloaded={} created={} duplicates={} quarantined={} errors={}",
            metrics.emails_scanned,
            metrics.attachments_seen,
            metrics.attachments_downloaded,
            metrics.receipts_created,
            metrics.duplicates_skipped,
            metrics.quarantined,
            metrics.errors,
        ));
        Ok(metrics)
    }

    /// Decision policy steps in fixed order; returns the explicit outcome.
    #[allow(clippy::too_many_arguments)]
    async fn process_attachment(
        &self,
        registry: &dyn DocumentRepository,
        events: &dyn EventRepository,
        message: &MailMessage,
        att: &MailAttachment,
        budget: &mut i64,
        metrics: &mut MailboxMetrics,
        dry_run: bool,
    ) -> Result<IntakeOutcome> {
        // Steps 1-3: classification. No registry row is ever created for a
        // quarantined attachment, in any mode.
        match classify(att, self.config) {
            Decision::Quarantine(QuarantineReason::DisallowedMime) => {
                // The sample is kept for operator review, which costs a
                // download.
                if !dry_run {
                    let bytes = self
                        .provider
                        .fetch_attachment(&message.id, &att.id)
                        .await?;
                    *budget -= 1;
                    metrics.attachments_downloaded += 1;
                    let digest = sha256_bytes(&bytes);
                    self.store
                        .write_quarantine(Utc::now().date_naive(), &att.filename, &digest, &bytes)
                        .await?;
                } else {
                    *budget -= 1;
                }
                metrics.quarantined += 1;
                return Ok(IntakeOutcome::Quarantined(QuarantineReason::DisallowedMime));
            }
            Decision::Quarantine(reason) => {
                // Size-based rejections are classification-only: no download,
                // no budget.
                metrics.quarantined += 1;
                return Ok(IntakeOutcome::Quarantined(reason));
            }
            Decision::Accept => {}
        }

        // Step 4: provider-id dedup, before any download.
        if registry.find_by_attachment_ref(&att.id).await?.is_some() {
            metrics.duplicates_skipped += 1;
            return Ok(IntakeOutcome::Duplicate);
        }

        // Steps 5-6: download, content dedup, persist.
        let bytes = self.provider.fetch_attachment(&message.id, &att.id).await?;
        *budget -= 1;
        metrics.attachments_downloaded += 1;

        let digest = sha256_bytes(&bytes);
        if registry.find_by_hash(&digest).await?.is_some() {
            metrics.duplicates_skipped += 1;
            debug!(
                subsystem = "pipeline",
                component = "collector",
                attachment_id = %att.id,
                content_hash = %digest,
                "duplicate content, skipped"
            );
            return Ok(IntakeOutcome::Duplicate);
        }

        if dry_run {
            metrics.receipts_created += 1;
            return Ok(IntakeOutcome::Created(uuid::Uuid::nil()));
        }

        let rel = self
            .store
            .write_incoming(Utc::now().date_naive(), &att.filename, &digest, &bytes)
            .await?;

        let req = CreateDocumentRequest {
            content_hash: digest,
            source_path: rel.parent().to_string(),
            original_filename: att.filename.clone(),
            stored_filename: rel.file_name().to_string(),
            mime_type: att.mime_type.clone(),
            size_bytes: Some(bytes.len() as i64),
            source: DocumentSource::Mailbox,
            provider_message_id: Some(message.id.clone()),
            provider_attachment_id: Some(att.id.clone()),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            received_at: message.received_at,
        };

        match registry.create_collected(req).await {
            Ok(doc) => {
                metrics.receipts_created += 1;
                events
                    .record(NewEvent::success(
                        doc.id,
                        Step::CollectFromMailbox,
                        0,
                        format!("collected {} from {}", rel, message.sender),
                    ))
                    .await?;
                Ok(IntakeOutcome::Created(doc.id))
            }
            // Lost race: the constraint is the authority.
            Err(e) if e.is_duplicate() => {
                metrics.duplicates_skipped += 1;
                Ok(IntakeOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    fn open_decision_log(&self, ctx: &JobContext) -> Result<Option<DecisionLog>> {
        if !self.config.verbose_decisions {
            return Ok(None);
        }
        let path = self
            .store
            .layout()
            .ops_log_path(ctx.job_name(), Utc::now().date_naive(), "jsonl");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Some(DecisionLog { file }))
    }
}

/// One JSON object per line, one line per attachment decision.
struct DecisionLog {
    file: std::fs::File,
}

impl DecisionLog {
    fn record(&mut self, value: serde_json::Value) {
        let _ = writeln!(self.file, "{}", value);
    }
}
