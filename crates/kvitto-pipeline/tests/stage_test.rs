//! Stage tests: extraction, vectorization, and brand identification over a
//! real temp filesystem, in-memory repositories, and a deterministic
//! embedding backend.

use std::sync::Arc;

use pgvector::Vector;
use serde_json::json;

use kvitto_core::{
    BrandRepository, CreateBrandRequest, CreateDocumentRequest, DocState, DocumentRepository,
    DocumentScope, EventRepository, EventStatus, JobStatus, Step, TriggeredBy,
};
use kvitto_pipeline::testing::{
    MemoryBrands, MemoryEvents, MemoryJobRuns, MemoryRegistry, MockEmbedder,
};
use kvitto_pipeline::{
    finalize_collected_move, run_extract_text, run_identify_brand, run_vectorize, JobCoordinator,
};
use kvitto_store::{sha256_bytes, ContentStore, StorageLayout};

struct Harness {
    _tmp: tempfile::TempDir,
    store: ContentStore,
    coordinator: JobCoordinator,
    registry: MemoryRegistry,
    brands: MemoryBrands,
    events: MemoryEvents,
}

async fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(tmp.path());
    layout.ensure().await.unwrap();
    let job_runs = Arc::new(MemoryJobRuns::new());
    Harness {
        store: ContentStore::new(layout.clone()),
        coordinator: JobCoordinator::new(job_runs, layout),
        registry: MemoryRegistry::new(),
        brands: MemoryBrands::new(),
        events: MemoryEvents::new(),
        _tmp: tmp,
    }
}

impl Harness {
    /// Register a collected document whose file really exists in the bucket.
    async fn collect(&self, name: &str, content: &str) -> uuid::Uuid {
        let dir = self.store.layout().root().join("receipts_raw/2024-05-01");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();

        let req = CreateDocumentRequest::from_dir(
            sha256_bytes(content.as_bytes()),
            "receipts_raw/2024-05-01",
            name,
            name,
        );
        self.registry.create_collected(req).await.unwrap().id
    }

    async fn extract(&self) -> kvitto_core::RunSummary {
        run_extract_text(
            &self.coordinator,
            &self.store,
            &self.registry,
            &self.events,
            &DocumentScope::All,
            TriggeredBy::Cli,
            false,
        )
        .await
        .unwrap()
    }

    async fn vectorize(&self, backend: &MockEmbedder) -> kvitto_core::RunSummary {
        run_vectorize(
            &self.coordinator,
            backend,
            &self.registry,
            &self.events,
            &DocumentScope::All,
            TriggeredBy::Cli,
            false,
        )
        .await
        .unwrap()
    }

    async fn identify(&self) -> kvitto_core::RunSummary {
        run_identify_brand(
            &self.coordinator,
            &self.registry,
            &self.brands,
            &self.events,
            &DocumentScope::All,
            TriggeredBy::Cli,
            false,
        )
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn test_extraction_splits_lines_and_preserves_empties() {
    let h = harness().await;
    let id = h.collect("r.txt", "CARREFOUR\n\nTOTAL 12,99\n").await;

    let summary = h.extract().await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["extracted"], 1);

    let doc = h.registry.get(id).await.unwrap();
    assert_eq!(doc.state, DocState::TextExtracted);
    assert_eq!(doc.raw_text.as_deref(), Some("CARREFOUR\n\nTOTAL 12,99\n"));

    let lines = h.registry.lines(id).await.unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].text, "CARREFOUR");
    assert_eq!(lines[1].text, "");
    assert_eq!(lines[1].line_no, 2);
    assert_eq!(lines[2].text, "TOTAL 12,99");
}

#[tokio::test]
async fn test_extraction_soft_skips_missing_file() {
    let h = harness().await;
    let id = h.collect("r.txt", "some text").await;
    std::fs::remove_file(
        h.store
            .layout()
            .root()
            .join("receipts_raw/2024-05-01/r.txt"),
    )
    .unwrap();

    let summary = h.extract().await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["skipped_missing"], 1);
    assert_eq!(summary.metrics["extracted"], json!(null));
    assert_eq!(h.registry.get(id).await.unwrap().state, DocState::Collected);
}

#[tokio::test]
async fn test_extraction_read_failure_is_counted_not_fatal() {
    let h = harness().await;

    // The stored path of the first document resolves to a directory, so
    // reading it fails with an error other than not-found.
    let dir = h
        .store
        .layout()
        .root()
        .join("receipts_raw/2024-05-01/broken.txt");
    std::fs::create_dir_all(&dir).unwrap();
    let req = CreateDocumentRequest::from_dir(
        sha256_bytes(b"placeholder for unreadable content"),
        "receipts_raw/2024-05-01",
        "broken.txt",
        "broken.txt",
    );
    let broken = h.registry.create_collected(req).await.unwrap().id;
    let healthy = h.collect("r.txt", "CARREFOUR\nTOTAL 12,99").await;

    let summary = h.extract().await;

    // The unreadable document is an error entry; the batch keeps going.
    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["errors"], 1);
    assert_eq!(summary.metrics["extracted"], 1);
    assert_eq!(
        h.registry.get(broken).await.unwrap().state,
        DocState::Collected
    );
    assert_eq!(
        h.registry.get(healthy).await.unwrap().state,
        DocState::TextExtracted
    );

    let events = h.events.list_for_document(broken).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.step == Step::ExtractText && e.status == EventStatus::Error));
}

#[tokio::test]
async fn test_vectorization_embeds_only_non_empty_lines() {
    let h = harness().await;
    let id = h.collect("r.txt", "CARREFOUR\n\nTOTAL 12,99").await;
    h.extract().await;

    let summary = h.vectorize(&MockEmbedder::new()).await;

    assert_eq!(summary.metrics["vectorized"], 1);
    assert_eq!(summary.metrics["lines_embedded"], 2);

    let doc = h.registry.get(id).await.unwrap();
    assert_eq!(doc.state, DocState::Vectorized);

    let embedded = h.registry.embedded_lines(id).await.unwrap();
    assert_eq!(embedded.len(), 2);
    assert!(embedded.iter().all(|l| !l.text.is_empty()));
}

#[tokio::test]
async fn test_vectorization_failure_keeps_document_in_text_extracted() {
    let h = harness().await;
    let id = h.collect("r.txt", "CARREFOUR").await;
    h.extract().await;

    let summary = h.vectorize(&MockEmbedder::failing()).await;

    // Per-document failure: counted, logged, batch run still succeeds.
    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.metrics["errors"], 1);
    assert_eq!(
        h.registry.get(id).await.unwrap().state,
        DocState::TextExtracted
    );

    let events = h.events.list_for_document(id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.step == Step::Vectorize && e.status == EventStatus::Error));
}

#[tokio::test]
async fn test_pipeline_identifies_brand_with_blended_score() {
    let h = harness().await;
    let id = h.collect("r.txt", "CARREFOUR\nTOTAL 12,99").await;

    let brand = h
        .brands
        .create(CreateBrandRequest {
            name: "Carrefour".to_string(),
            aliases: vec![],
            website: "https://carrefour.example".to_string(),
            metadata: json!({}),
        })
        .await
        .unwrap();
    h.brands
        .set_alias_embedding(brand.id, "Carrefour", &Vector::from(vec![1.0, 0.0]))
        .await
        .unwrap();

    // The brand line sits at cosine 0.92 from the alias; the other line is
    // orthogonal.
    let sim = 0.92f32;
    let ortho = (1.0 - sim * sim).sqrt();
    let backend = MockEmbedder::new()
        .with_override("CARREFOUR", vec![sim, ortho])
        .with_override("TOTAL 12,99", vec![0.0, 1.0]);

    h.extract().await;
    h.vectorize(&backend).await;
    let summary = h.identify().await;

    assert_eq!(summary.metrics["matched"], 1);

    let doc = h.registry.get(id).await.unwrap();
    assert_eq!(doc.state, DocState::BrandIdentified);
    let matched = doc.brand.unwrap();
    assert_eq!(matched.name, "Carrefour");
    assert_eq!(matched.alias, "Carrefour");
    assert_eq!(matched.score_vec, 0.92);
    assert_eq!(matched.regex_bonus, 0.3);
    assert_eq!(matched.score, 0.796);
}

#[tokio::test]
async fn test_no_alias_embeddings_leaves_document_unmatched() {
    let h = harness().await;
    let id = h.collect("r.txt", "UNKNOWN SHOP").await;

    h.extract().await;
    h.vectorize(&MockEmbedder::new()).await;
    let summary = h.identify().await;

    assert_eq!(summary.metrics["unmatched"], 1);

    let doc = h.registry.get(id).await.unwrap();
    assert_eq!(doc.state, DocState::Vectorized);
    assert!(doc.brand.is_none());

    let events = h.events.list_for_document(id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.step == Step::IdentifyBrand && e.message == "no-brand-found"));
}

#[tokio::test]
async fn test_finalize_move_relocates_stragglers_once() {
    let h = harness().await;
    let content = b"left behind in intake";
    let incoming = h.store.layout().root().join("incoming");
    std::fs::write(incoming.join("r.txt"), content).unwrap();

    // A row exists but the file never made it into the bucket.
    let req = CreateDocumentRequest::from_dir(
        kvitto_store::sha256_bytes(content),
        "incoming",
        "r.txt",
        "r.txt",
    );
    let id = h.registry.create_collected(req).await.unwrap().id;

    let date = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let moved = finalize_collected_move(&h.registry, &h.store, id, date)
        .await
        .unwrap();
    assert!(moved);

    let doc = h.registry.get(id).await.unwrap();
    assert_eq!(doc.source_path, "receipts_raw/2024-05-01");
    assert!(!incoming.join("r.txt").exists());
    assert!(h
        .store
        .layout()
        .root()
        .join("receipts_raw/2024-05-01/r.txt")
        .exists());

    // Second call finds everything already in place.
    let moved_again = finalize_collected_move(&h.registry, &h.store, id, date)
        .await
        .unwrap();
    assert!(!moved_again);
}

#[tokio::test]
async fn test_reset_returns_document_to_start_of_pipeline() {
    let h = harness().await;
    let id = h.collect("r.txt", "CARREFOUR").await;
    h.extract().await;
    h.vectorize(&MockEmbedder::new()).await;

    h.registry.reset_to_collected(id).await.unwrap();

    let doc = h.registry.get(id).await.unwrap();
    assert_eq!(doc.state, DocState::Collected);
    assert!(doc.raw_text.is_none());
    assert!(doc.raw_text_hash.is_none());
    assert!(h.registry.lines(id).await.unwrap().is_empty());

    // The file is still in place, so the document can be re-extracted.
    let summary = h.extract().await;
    assert_eq!(summary.metrics["extracted"], 1);
    assert_eq!(
        h.registry.get(id).await.unwrap().state,
        DocState::TextExtracted
    );
}
