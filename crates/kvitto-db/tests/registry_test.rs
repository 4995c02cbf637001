//! Registry integration tests against a real PostgreSQL.
//!
//! All tests are `#[ignore]`d; run with `cargo test -- --ignored` against a
//! database with the pgvector extension available.

use pgvector::Vector;
use uuid::Uuid;

use kvitto_core::{
    split_into_lines, BrandMatch, BrandRepository, CreateBrandRequest, CreateDocumentRequest,
    DocState, DocumentRepository, DocumentScope, Error,
};
use kvitto_db::test_fixtures::TestDatabase;

fn dir_request(hash: &str, name: &str) -> CreateDocumentRequest {
    CreateDocumentRequest::from_dir(hash, "incoming", name, name)
}

#[tokio::test]
#[ignore] // requires postgres
async fn test_duplicate_hash_rejected_by_constraint() {
    let db = TestDatabase::new().await;
    let documents = db.documents();

    documents
        .create_collected(dir_request("hash-a", "a.jpg"))
        .await
        .unwrap();

    let err = documents
        .create_collected(dir_request("hash-a", "copy-of-a.jpg"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateContent(_)));

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires postgres
async fn test_duplicate_attachment_id_rejected() {
    let db = TestDatabase::new().await;
    let documents = db.documents();

    let mut req = dir_request("hash-b1", "b.pdf");
    req.provider_attachment_id = Some("att-123".to_string());
    documents.create_collected(req).await.unwrap();

    let mut req = dir_request("hash-b2", "b-again.pdf");
    req.provider_attachment_id = Some("att-123".to_string());
    let err = documents.create_collected(req).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateContent(_)));

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires postgres
async fn test_guarded_transition_rejects_wrong_state() {
    let db = TestDatabase::new().await;
    let documents = db.documents();

    let doc = documents
        .create_collected(dir_request("hash-c", "c.jpg"))
        .await
        .unwrap();
    assert_eq!(doc.state, DocState::Collected);

    // A transition naming the wrong expected state must not clobber.
    let err = documents
        .transition(doc.id, DocState::Vectorized, DocState::BrandIdentified)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let unchanged = documents.get(doc.id).await.unwrap();
    assert_eq!(unchanged.state, DocState::Collected);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires postgres
async fn test_apply_extraction_is_atomic_and_guarded() {
    let db = TestDatabase::new().await;
    let documents = db.documents();

    let doc = documents
        .create_collected(dir_request("hash-d", "d.jpg"))
        .await
        .unwrap();

    let raw = "CARREFOUR\n\nTOTAL 12,99";
    let lines = split_into_lines(raw);
    documents
        .apply_extraction(doc.id, raw, "text-hash", &lines, 42)
        .await
        .unwrap();

    let doc = documents.get(doc.id).await.unwrap();
    assert_eq!(doc.state, DocState::TextExtracted);
    assert_eq!(doc.raw_text.as_deref(), Some(raw));

    let stored = documents.lines(doc.id).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[1].text, "");
    assert_eq!(stored[2].line_no, 3);

    // A second extraction attempt finds the document past `collected`.
    let err = documents
        .apply_extraction(doc.id, raw, "text-hash", &lines, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires postgres
async fn test_reset_clears_derived_fields() {
    let db = TestDatabase::new().await;
    let documents = db.documents();

    let doc = documents
        .create_collected(dir_request("hash-e", "e.jpg"))
        .await
        .unwrap();
    let lines = split_into_lines("LIDL\nTOTAL 5,00");
    documents
        .apply_extraction(doc.id, "LIDL\nTOTAL 5,00", "th", &lines, 1)
        .await
        .unwrap();
    documents
        .set_line_embeddings(doc.id, &[(1, Vector::from(vec![1.0, 0.0]))])
        .await
        .unwrap();
    documents
        .transition(doc.id, DocState::TextExtracted, DocState::Vectorized)
        .await
        .unwrap();
    documents
        .set_brand(
            doc.id,
            &BrandMatch {
                brand_id: Uuid::new_v4(),
                name: "Lidl".to_string(),
                score_vec: 0.9,
                regex_bonus: 0.3,
                score: 0.78,
                alias: "LIDL".to_string(),
            },
            7,
        )
        .await
        .unwrap();

    documents.reset_to_collected(doc.id).await.unwrap();

    let doc = documents.get(doc.id).await.unwrap();
    assert_eq!(doc.state, DocState::Collected);
    assert!(doc.raw_text.is_none());
    assert!(doc.raw_text_hash.is_none());
    assert!(doc.brand.is_none());
    assert!(documents.lines(doc.id).await.unwrap().is_empty());

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires postgres
async fn test_list_in_state_scopes() {
    let db = TestDatabase::new().await;
    let documents = db.documents();

    let d1 = documents
        .create_collected(dir_request("hash-f1", "f1.jpg"))
        .await
        .unwrap();
    let d2 = documents
        .create_collected(dir_request("hash-f2", "f2.jpg"))
        .await
        .unwrap();

    let all = documents
        .list_in_state(DocState::Collected, &DocumentScope::All)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    // Ordered by creation time.
    assert_eq!(all[0].id, d1.id);

    let just_d2 = documents
        .list_in_state(DocState::Collected, &DocumentScope::Ids(vec![d2.id]))
        .await
        .unwrap();
    assert_eq!(just_d2.len(), 1);
    assert_eq!(just_d2[0].id, d2.id);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // requires postgres
async fn test_brand_aliases_include_canonical_name() {
    let db = TestDatabase::new().await;
    let brands = db.brands();

    let brand = brands
        .create(CreateBrandRequest {
            name: "Carrefour".to_string(),
            aliases: vec!["Carrefour Market".to_string()],
            website: "https://carrefour.fr".to_string(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    brands
        .set_alias_embedding(brand.id, "Carrefour", &Vector::from(vec![1.0, 0.0]))
        .await
        .unwrap();
    brands
        .set_alias_embedding(
            brand.id,
            "Carrefour Market",
            &Vector::from(vec![0.9, 0.1]),
        )
        .await
        .unwrap();

    let tuples = brands.alias_embeddings().await.unwrap();
    let aliases: Vec<&str> = tuples.iter().map(|t| t.alias.as_str()).collect();
    assert_eq!(aliases, vec!["Carrefour", "Carrefour Market"]);

    db.cleanup().await;
}
