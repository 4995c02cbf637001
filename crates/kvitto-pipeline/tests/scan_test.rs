//! Directory scanner integration tests over a real temp filesystem and
//! in-memory repositories.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use kvitto_core::{DocState, DocumentRepository, Error, JobStatus, ScanConfig, TriggeredBy};
use kvitto_pipeline::testing::{MemoryEvents, MemoryJobRuns, MemoryRegistry};
use kvitto_pipeline::{run_dir_scan, JobCoordinator};
use kvitto_store::{sha256_bytes, ContentStore, StorageLayout};

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
    fn root(&self) -> &std::path::Path {
        self.store.layout().root()
    }

    fn write_incoming(&self, name: &str, bytes: &[u8]) {
        let path = self.root().join("incoming").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    async fn scan(&self, config: &ScanConfig, dry_run: bool) -> kvitto_core::RunSummary {
        run_dir_scan(
            &self.coordinator,
            &self.store,
            config,
            &self.registry,
            &self.events,
            TriggeredBy::Cli,
            dry_run,
        )
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn test_scan_registers_new_file_in_dated_bucket() {
    let h = harness().await;
    let bytes = b"CARREFOUR\nTOTAL 12,99\n";
    h.write_incoming("receipt.txt", bytes);

    let summary = h.scan(&ScanConfig::default(), false).await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["scanned"], 1);
    assert_eq!(summary.metrics["created"], 1);

    let digest = sha256_bytes(bytes);
    let doc = h.registry.find_by_hash(&digest).await.unwrap().unwrap();
    assert_eq!(doc.state, DocState::Collected);
    assert_eq!(doc.original_filename, "receipt.txt");
    assert_eq!(
        doc.source_path,
        format!("receipts_raw/{}", Utc::now().date_naive().format("%Y-%m-%d"))
    );

    // The file left the intake area and landed in the bucket.
    assert!(!h.root().join("incoming/receipt.txt").exists());
    let bucket_file = h
        .root()
        .join(&doc.source_path)
        .join(&doc.stored_filename);
    assert_eq!(std::fs::read(bucket_file).unwrap(), bytes);
}

#[tokio::test]
async fn test_rescanning_same_content_is_a_duplicate() {
    let h = harness().await;
    h.write_incoming("a.txt", b"same bytes");
    h.scan(&ScanConfig::default(), false).await;

    // A second copy of the same content arrives under a different name.
    h.write_incoming("b.txt", b"same bytes");
    let summary = h.scan(&ScanConfig::default(), false).await;

    assert_eq!(summary.metrics["scanned"], 1);
    assert_eq!(summary.metrics["duplicates"], 1);
    assert_eq!(h.registry.document_count(), 1);
}

#[tokio::test]
async fn test_name_collision_in_bucket_gets_digest_suffix() {
    let h = harness().await;
    h.write_incoming("a.txt", b"first content");
    h.scan(&ScanConfig::default(), false).await;

    h.write_incoming("a.txt", b"second content");
    let summary = h.scan(&ScanConfig::default(), false).await;
    assert_eq!(summary.metrics["created"], 1);

    let digest = sha256_bytes(b"second content");
    let doc = h.registry.find_by_hash(&digest).await.unwrap().unwrap();
    assert_eq!(doc.original_filename, "a.txt");
    assert_eq!(doc.stored_filename, format!("a__{}.txt", &digest[..8]));
}

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let h = harness().await;
    h.write_incoming("receipt.txt", b"payload");

    let summary = h.scan(&ScanConfig::default(), true).await;

    assert_eq!(summary.metrics["created"], 1);
    assert_eq!(h.registry.document_count(), 0);
    assert!(h.root().join("incoming/receipt.txt").exists());
}

#[tokio::test]
async fn test_pattern_filters_candidates() {
    let h = harness().await;
    h.write_incoming("receipt.pdf", b"pdf bytes");
    h.write_incoming("notes.txt", b"not a receipt");

    let config = ScanConfig {
        pattern: "*.pdf".to_string(),
        ..ScanConfig::default()
    };
    let summary = h.scan(&config, false).await;

    assert_eq!(summary.metrics["scanned"], 1);
    assert_eq!(summary.metrics["created"], 1);
    assert!(h.root().join("incoming/notes.txt").exists());
}

#[tokio::test]
async fn test_nested_files_keep_subdirectories_under_bucket() {
    let h = harness().await;
    h.write_incoming("2024/may/r.txt", b"nested receipt");

    h.scan(&ScanConfig::default(), false).await;

    let digest = sha256_bytes(b"nested receipt");
    let doc = h.registry.find_by_hash(&digest).await.unwrap().unwrap();
    assert_eq!(
        doc.source_path,
        format!(
            "receipts_raw/{}/2024/may",
            Utc::now().date_naive().format("%Y-%m-%d")
        )
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreadable_subtree_is_skipped_not_fatal() {
    use std::os::unix::fs::PermissionsExt;

    let h = harness().await;
    h.write_incoming("readable.txt", b"still ingested");
    h.write_incoming("locked/hidden.txt", b"cannot be listed");
    let locked = h.root().join("incoming/locked");
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

    let summary = h.scan(&ScanConfig::default(), false).await;

    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

    // The walk skips what it cannot read and ingests the rest.
    assert_eq!(summary.status, JobStatus::Success);
    let digest = sha256_bytes(b"still ingested");
    assert!(h.registry.find_by_hash(&digest).await.unwrap().is_some());
}

#[tokio::test]
async fn test_event_write_failure_still_counts_created() {
    let h = harness().await;
    h.write_incoming("receipt.txt", b"payload");
    let events = MemoryEvents::failing();

    let summary = run_dir_scan(
        &h.coordinator,
        &h.store,
        &ScanConfig::default(),
        &h.registry,
        &events,
        TriggeredBy::Cli,
        false,
    )
    .await
    .unwrap();

    // The document was registered, so the failed event write is a log-only
    // concern.
    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["created"], 1);
    assert_eq!(summary.metrics["errors"], json!(null));
    assert_eq!(h.registry.document_count(), 1);
}

#[tokio::test]
async fn test_stage_error_survives_failed_run_bookkeeping() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(tmp.path());
    layout.ensure().await.unwrap();
    let job_runs = Arc::new(MemoryJobRuns::failing_finish());
    let store = ContentStore::new(layout.clone());
    let coordinator = JobCoordinator::new(job_runs.clone(), layout);
    let registry = MemoryRegistry::new();
    let events = MemoryEvents::new();

    let config = ScanConfig {
        pattern: "[".to_string(),
        ..ScanConfig::default()
    };
    let err = run_dir_scan(
        &coordinator,
        &store,
        &config,
        &registry,
        &events,
        TriggeredBy::Cli,
        false,
    )
    .await
    .unwrap_err();

    // The caller sees the stage failure, not the failed close-out write.
    assert!(matches!(err, Error::Config(_)));
    // The row stayed running because finish never succeeded.
    assert_eq!(job_runs.all()[0].status, JobStatus::Running);
}

#[tokio::test]
async fn test_invalid_pattern_fails_the_run_and_records_it() {
    let h = harness().await;
    h.write_incoming("receipt.txt", b"payload");

    let config = ScanConfig {
        pattern: "[".to_string(),
        ..ScanConfig::default()
    };
    let result = run_dir_scan(
        &h.coordinator,
        &h.store,
        &config,
        &h.registry,
        &h.events,
        TriggeredBy::Cli,
        false,
    )
    .await;

    assert!(result.is_err());
    let runs = h.job_runs.all();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, JobStatus::Failed);
    assert!(runs[0].error_message.contains("pattern"));
}
