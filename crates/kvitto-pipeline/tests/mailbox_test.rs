//! Mailbox collector integration tests over a scripted provider, a real
//! temp filesystem, and in-memory repositories.

use std::sync::Arc;

use chrono::Utc;

use kvitto_core::{
    CreateDocumentRequest, DocumentRepository, JobStatus, MailAttachment, MailMessage,
    MailboxConfig, MessageDisposition, RunSummary, TriggeredBy,
};
use kvitto_pipeline::testing::{MemoryEvents, MemoryJobRuns, MemoryRegistry, MockMailbox};
use kvitto_pipeline::{run_mailbox_collect, JobCoordinator};
use kvitto_store::{sha256_bytes, ContentStore, Lockfile, StorageLayout};

struct Harness {
    _tmp: tempfile::TempDir,
    store: ContentStore,
    coordinator: JobCoordinator,
    job_runs: Arc<MemoryJobRuns>,
    registry: MemoryRegistry,
    events: MemoryEvents,
}

async fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(tmp.path());
    layout.ensure().await.unwrap();
    let job_runs = Arc::new(MemoryJobRuns::new());
    Harness {
        store: ContentStore::new(layout.clone()),
        coordinator: JobCoordinator::new(job_runs.clone(), layout),
        job_runs,
        registry: MemoryRegistry::new(),
        events: MemoryEvents::new(),
        _tmp: tmp,
    }
}

impl Harness {
    async fn collect(
        &self,
        mailbox: &MockMailbox,
        config: &MailboxConfig,
        dry_run: bool,
    ) -> RunSummary {
        run_mailbox_collect(
            &self.coordinator,
            mailbox,
            &self.store,
            config,
            &self.registry,
            &self.events,
            None,
            TriggeredBy::System,
            dry_run,
        )
        .await
        .unwrap()
    }
}

fn attachment(id: &str, filename: &str, mime: &str, size: i64) -> MailAttachment {
    MailAttachment {
        id: id.to_string(),
        filename: filename.to_string(),
        mime_type: mime.to_string(),
        size_bytes: size,
        inline: false,
    }
}

fn message(id: &str, sender: &str, attachments: Vec<MailAttachment>) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        sender: sender.to_string(),
        subject: "your receipt".to_string(),
        received_at: Some(Utc::now()),
        attachments,
    }
}

#[tokio::test]
async fn test_accepted_attachment_becomes_document_with_provenance() {
    let h = harness().await;
    let bytes = b"%PDF-1.4 receipt".to_vec();
    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![attachment("att-1", "kvitto.pdf", "application/pdf", 16)],
        ),
        vec![bytes.clone()],
    );

    let summary = h.collect(&mailbox, &MailboxConfig::default(), false).await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["receipts_created"], 1);
    assert_eq!(summary.metrics["attachments_downloaded"], 1);

    let digest = sha256_bytes(&bytes);
    let doc = h.registry.find_by_hash(&digest).await.unwrap().unwrap();
    assert_eq!(doc.provider_message_id.as_deref(), Some("msg-1"));
    assert_eq!(doc.provider_attachment_id.as_deref(), Some("att-1"));
    assert_eq!(doc.sender, "receipts@shop.example");
    assert_eq!(doc.mime_type, "application/pdf");

    // The bytes were written under the dated incoming area.
    let stored = h
        .store
        .layout()
        .root()
        .join(&doc.source_path)
        .join(&doc.stored_filename);
    assert_eq!(std::fs::read(stored).unwrap(), bytes);

    assert_eq!(
        mailbox.processed(),
        vec![("msg-1".to_string(), MessageDisposition::Imported)]
    );
}

#[tokio::test]
async fn test_disallowed_mime_is_quarantined_and_never_registered() {
    let h = harness().await;
    let bytes = b"PK\x03\x04 zip bytes".to_vec();
    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![attachment("att-1", "archive.zip", "application/zip", 16)],
        ),
        vec![bytes.clone()],
    );

    let summary = h.collect(&mailbox, &MailboxConfig::default(), false).await;

    assert_eq!(summary.metrics["quarantined"], 1);
    assert_eq!(summary.metrics["receipts_created"], 0);
    assert_eq!(h.registry.document_count(), 0);

    // The sample is kept for operator review.
    let quarantine = h
        .store
        .layout()
        .root()
        .join("quarantine")
        .join(Utc::now().date_naive().format("%Y-%m-%d").to_string())
        .join("archive.zip");
    assert_eq!(std::fs::read(quarantine).unwrap(), bytes);

    assert_eq!(
        mailbox.processed(),
        vec![("msg-1".to_string(), MessageDisposition::Quarantined)]
    );
}

#[tokio::test]
async fn test_quarantine_skips_registry_in_dry_run_too() {
    let h = harness().await;
    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![attachment("att-1", "archive.zip", "application/zip", 16)],
        ),
        vec![b"zip".to_vec()],
    );

    let summary = h.collect(&mailbox, &MailboxConfig::default(), true).await;

    assert_eq!(summary.metrics["quarantined"], 1);
    assert_eq!(h.registry.document_count(), 0);
    // Dry run downloads nothing and labels nothing.
    assert_eq!(summary.metrics["attachments_downloaded"], 0);
    assert!(mailbox.processed().is_empty());
}

#[tokio::test]
async fn test_attachment_id_dedup_skips_without_download() {
    let h = harness().await;
    let mut req = CreateDocumentRequest::from_dir("somehash", "receipts_raw/2024-05-01", "a", "a");
    req.provider_attachment_id = Some("att-1".to_string());
    h.registry.create_collected(req).await.unwrap();

    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![attachment("att-1", "kvitto.pdf", "application/pdf", 16)],
        ),
        vec![b"pdf bytes".to_vec()],
    );

    let summary = h.collect(&mailbox, &MailboxConfig::default(), false).await;

    assert_eq!(summary.metrics["duplicates_skipped"], 1);
    assert_eq!(summary.metrics["attachments_downloaded"], 0);
    assert_eq!(h.registry.document_count(), 1);
}

#[tokio::test]
async fn test_content_hash_dedup_across_sources() {
    let h = harness().await;
    let bytes = b"seen before".to_vec();
    // Already collected via the directory scanner.
    h.registry
        .create_collected(CreateDocumentRequest::from_dir(
            sha256_bytes(&bytes),
            "receipts_raw/2024-05-01",
            "a.txt",
            "a.txt",
        ))
        .await
        .unwrap();

    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![attachment("att-1", "kvitto.pdf", "application/pdf", 11)],
        ),
        vec![bytes],
    );

    let summary = h.collect(&mailbox, &MailboxConfig::default(), false).await;

    // The download happened (content dedup needs the bytes), but no new row.
    assert_eq!(summary.metrics["attachments_downloaded"], 1);
    assert_eq!(summary.metrics["duplicates_skipped"], 1);
    assert_eq!(h.registry.document_count(), 1);
}

#[tokio::test]
async fn test_attachment_budget_stops_the_batch() {
    let h = harness().await;
    let mailbox = MockMailbox::new()
        .with_message(
            message(
                "msg-1",
                "receipts@shop.example",
                vec![
                    attachment("att-1", "a.pdf", "application/pdf", 4),
                    attachment("att-2", "b.pdf", "application/pdf", 4),
                ],
            ),
            vec![b"aaaa".to_vec(), b"bbbb".to_vec()],
        )
        .with_message(
            message(
                "msg-2",
                "receipts@other.example",
                vec![attachment("att-3", "c.pdf", "application/pdf", 4)],
            ),
            vec![b"cccc".to_vec()],
        );

    let config = MailboxConfig {
        max_attachments: 1,
        ..MailboxConfig::default()
    };
    let summary = h.collect(&mailbox, &config, false).await;

    assert_eq!(summary.metrics["attachments_seen"], 1);
    assert_eq!(summary.metrics["receipts_created"], 1);
    assert_eq!(h.registry.document_count(), 1);
}

#[tokio::test]
async fn test_blacklisted_sender_is_skipped_entirely() {
    let h = harness().await;
    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "NEWSLETTER@shop.example",
            vec![attachment("att-1", "kvitto.pdf", "application/pdf", 4)],
        ),
        vec![b"pdf!".to_vec()],
    );

    let config = MailboxConfig {
        blacklist_senders: vec!["newsletter@".to_string()],
        ..MailboxConfig::default()
    };
    let summary = h.collect(&mailbox, &config, false).await;

    assert_eq!(summary.metrics["emails_scanned"], 1);
    assert_eq!(summary.metrics["attachments_seen"], 0);
    assert_eq!(h.registry.document_count(), 0);
    assert!(mailbox.processed().is_empty());
}

#[tokio::test]
async fn test_label_failure_is_counted_but_documents_survive() {
    let h = harness().await;
    let mut mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![attachment("att-1", "kvitto.pdf", "application/pdf", 9)],
        ),
        vec![b"pdf bytes".to_vec()],
    );
    mailbox.fail_mark_processed = true;

    let summary = h.collect(&mailbox, &MailboxConfig::default(), false).await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["receipts_created"], 1);
    assert_eq!(summary.metrics["errors"], 1);
    assert_eq!(h.registry.document_count(), 1);
}

#[tokio::test]
async fn test_lockfile_present_records_skipped_run() {
    let h = harness().await;
    let lock_path = h.coordinator.layout().lockfile_path("collect_mailbox");
    let _held = Lockfile::acquire(&lock_path).unwrap().unwrap();

    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![attachment("att-1", "kvitto.pdf", "application/pdf", 4)],
        ),
        vec![b"pdf!".to_vec()],
    );

    let summary = h.collect(&mailbox, &MailboxConfig::default(), false).await;

    assert_eq!(summary.status, JobStatus::Skipped);
    assert_eq!(h.registry.document_count(), 0);
    let runs = h.job_runs.all();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, JobStatus::Skipped);
}

#[tokio::test]
async fn test_verbose_decisions_written_as_jsonl() {
    let h = harness().await;
    let mailbox = MockMailbox::new().with_message(
        message(
            "msg-1",
            "receipts@shop.example",
            vec![
                attachment("att-1", "kvitto.pdf", "application/pdf", 9),
                attachment("att-2", "archive.zip", "application/zip", 3),
            ],
        ),
        vec![b"pdf bytes".to_vec(), b"zip".to_vec()],
    );

    let config = MailboxConfig {
        verbose_decisions: true,
        ..MailboxConfig::default()
    };
    h.collect(&mailbox, &config, false).await;

    let path = h.store.layout().ops_log_path(
        "collect_mailbox",
        Utc::now().date_naive(),
        "jsonl",
    );
    let content = std::fs::read_to_string(path).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["decision"], "created");
    assert_eq!(lines[1]["decision"], "quarantined");
    assert_eq!(lines[1]["detail"], "disallowed_mime");
}
