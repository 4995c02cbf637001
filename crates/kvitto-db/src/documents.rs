//! PostgreSQL document registry.
//!
//! Uniqueness by content hash is enforced by the database constraint;
//! `find_by_hash` exists only as a fast path. State transitions are guarded
//! UPDATEs naming the expected current state, so a lost race surfaces as
//! `Error::InvalidTransition` instead of clobbering a concurrent result.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use kvitto_core::{
    BrandMatch, CreateDocumentRequest, DocState, DocumentRepository, DocumentScope,
    DocumentSource, Error, EventStatus, Line, NewLine, Result, Step,
};

const DOCUMENT_COLUMNS: &str = r#"id, state, content_hash, source_path, original_filename,
    stored_filename, mime_type, size_bytes, raw_text, raw_text_hash, source,
    provider_message_id, provider_attachment_id, sender, subject, received_at,
    brand, created_at, updated_at"#;

/// PostgreSQL implementation of [`DocumentRepository`].
pub struct PgDocumentRepository {
    pool: PgPool,
}

impl PgDocumentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn create_collected(&self, req: CreateDocumentRequest) -> Result<kvitto_core::Document> {
        let id = Uuid::now_v7();
        let row = sqlx::query(&format!(
            r#"INSERT INTO documents
               (id, state, content_hash, source_path, original_filename, stored_filename,
                mime_type, size_bytes, source, provider_message_id, provider_attachment_id,
                sender, subject, received_at)
               VALUES ($1, 'collected', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               RETURNING {DOCUMENT_COLUMNS}"#
        ))
        .bind(id)
        .bind(&req.content_hash)
        .bind(&req.source_path)
        .bind(&req.original_filename)
        .bind(&req.stored_filename)
        .bind(&req.mime_type)
        .bind(req.size_bytes)
        .bind(req.source.as_str())
        .bind(&req.provider_message_id)
        .bind(&req.provider_attachment_id)
        .bind(&req.sender)
        .bind(&req.subject)
        .bind(req.received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &req.content_hash))?;

        document_from_row(&row)
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<kvitto_core::Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = $1"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    async fn find_by_attachment_ref(
        &self,
        provider_attachment_id: &str,
    ) -> Result<Option<kvitto_core::Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE provider_attachment_id = $1"
        ))
        .bind(provider_attachment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<kvitto_core::Document> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::DocumentNotFound(id))?;

        document_from_row(&row)
    }

    async fn list_in_state(
        &self,
        state: DocState,
        scope: &DocumentScope,
    ) -> Result<Vec<kvitto_core::Document>> {
        let rows = match scope {
            DocumentScope::All => {
                sqlx::query(&format!(
                    r#"SELECT {DOCUMENT_COLUMNS} FROM documents
                       WHERE state = $1 ORDER BY created_at"#
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            DocumentScope::Since(ts) => {
                sqlx::query(&format!(
                    r#"SELECT {DOCUMENT_COLUMNS} FROM documents
                       WHERE state = $1 AND created_at >= $2 ORDER BY created_at"#
                ))
                .bind(state.as_str())
                .bind(ts)
                .fetch_all(&self.pool)
                .await?
            }
            DocumentScope::Ids(ids) => {
                sqlx::query(&format!(
                    r#"SELECT {DOCUMENT_COLUMNS} FROM documents
                       WHERE state = $1 AND id = ANY($2) ORDER BY created_at"#
                ))
                .bind(state.as_str())
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(document_from_row).collect()
    }

    async fn transition(&self, id: Uuid, from_expected: DocState, to: DocState) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE documents SET state = $3, updated_at = NOW()
               WHERE id = $1 AND state = $2"#,
        )
        .bind(id)
        .bind(from_expected.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition {
                id,
                expected: from_expected,
                to,
            });
        }
        debug!(
            subsystem = "db",
            component = "documents",
            op = "transition",
            document_id = %id,
            from = from_expected.as_str(),
            to = to.as_str(),
            "Document state advanced"
        );
        Ok(())
    }

    async fn reset_to_collected(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE documents
               SET state = 'collected', raw_text = NULL, raw_text_hash = NULL,
                   brand = NULL, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }

        sqlx::query("DELETE FROM document_lines WHERE document_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_location(
        &self,
        id: Uuid,
        source_path: &str,
        stored_filename: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE documents
               SET source_path = $2, stored_filename = $3, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(source_path)
        .bind(stored_filename)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }
        Ok(())
    }

    async fn apply_extraction(
        &self,
        id: Uuid,
        raw_text: &str,
        raw_text_hash: &str,
        lines: &[NewLine],
        duration_ms: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Guarded write: the document must still be in `collected`.
        let result = sqlx::query(
            r#"UPDATE documents
               SET raw_text = $2, raw_text_hash = $3, state = 'text_extracted',
                   updated_at = NOW()
               WHERE id = $1 AND state = 'collected'"#,
        )
        .bind(id)
        .bind(raw_text)
        .bind(raw_text_hash)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition {
                id,
                expected: DocState::Collected,
                to: DocState::TextExtracted,
            });
        }

        // Wholesale replacement, never a patch.
        sqlx::query("DELETE FROM document_lines WHERE document_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for line in lines {
            sqlx::query(
                "INSERT INTO document_lines (id, document_id, line_no, text) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::now_v7())
            .bind(id)
            .bind(line.line_no)
            .bind(&line.text)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"INSERT INTO processing_events
               (id, document_id, step, status, finished_at, duration_ms, message)
               VALUES ($1, $2, $3, $4, NOW(), $5, $6)"#,
        )
        .bind(Uuid::now_v7())
        .bind(id)
        .bind(Step::ExtractText.as_str())
        .bind(EventStatus::Success.as_str())
        .bind(duration_ms)
        .bind(format!("extracted {} lines", lines.len()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn lines(&self, document_id: Uuid) -> Result<Vec<Line>> {
        let rows = sqlx::query(
            r#"SELECT id, document_id, line_no, text, embedding
               FROM document_lines WHERE document_id = $1 ORDER BY line_no"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(line_from_row).collect())
    }

    async fn embedded_lines(&self, document_id: Uuid) -> Result<Vec<Line>> {
        let rows = sqlx::query(
            r#"SELECT id, document_id, line_no, text, embedding
               FROM document_lines
               WHERE document_id = $1 AND embedding IS NOT NULL
               ORDER BY line_no"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(line_from_row).collect())
    }

    async fn set_line_embeddings(
        &self,
        document_id: Uuid,
        embeddings: &[(i32, Vector)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (line_no, embedding) in embeddings {
            sqlx::query(
                r#"UPDATE document_lines SET embedding = $3
                   WHERE document_id = $1 AND line_no = $2"#,
            )
            .bind(document_id)
            .bind(line_no)
            .bind(embedding)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_brand(&self, id: Uuid, brand: &BrandMatch, duration_ms: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE documents
               SET brand = $2, state = 'brand_identified', updated_at = NOW()
               WHERE id = $1 AND state = 'vectorized'"#,
        )
        .bind(id)
        .bind(serde_json::to_value(brand)?)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::InvalidTransition {
                id,
                expected: DocState::Vectorized,
                to: DocState::BrandIdentified,
            });
        }

        sqlx::query(
            r#"INSERT INTO processing_events
               (id, document_id, step, status, finished_at, duration_ms, message)
               VALUES ($1, $2, $3, $4, NOW(), $5, $6)"#,
        )
        .bind(Uuid::now_v7())
        .bind(id)
        .bind(Step::IdentifyBrand.as_str())
        .bind(EventStatus::Success.as_str())
        .bind(duration_ms)
        .bind(format!(
            "matched '{}' via alias '{}' (vec {:.4}, bonus {:.3}, score {:.4})",
            brand.name, brand.alias, brand.score_vec, brand.regex_bonus, brand.score
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Map a unique-constraint violation to the intake-level duplicate error.
fn map_unique_violation(e: sqlx::Error, content_hash: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.code().as_deref() == Some("23505") {
            return Error::DuplicateContent(content_hash.to_string());
        }
    }
    Error::Database(e)
}

fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<kvitto_core::Document> {
    let brand: Option<serde_json::Value> = row.get("brand");
    let brand = brand.map(serde_json::from_value).transpose()?;

    Ok(kvitto_core::Document {
        id: row.get("id"),
        state: DocState::from_str(row.get("state")).unwrap_or(DocState::Collected),
        content_hash: row.get("content_hash"),
        source_path: row.get("source_path"),
        original_filename: row.get("original_filename"),
        stored_filename: row.get("stored_filename"),
        mime_type: row.get("mime_type"),
        size_bytes: row.get("size_bytes"),
        raw_text: row.get("raw_text"),
        raw_text_hash: row.get("raw_text_hash"),
        source: DocumentSource::from_str(row.get("source")).unwrap_or(DocumentSource::Dir),
        provider_message_id: row.get("provider_message_id"),
        provider_attachment_id: row.get("provider_attachment_id"),
        sender: row.get("sender"),
        subject: row.get("subject"),
        received_at: row.get("received_at"),
        brand,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn line_from_row(row: &sqlx::postgres::PgRow) -> Line {
    Line {
        id: row.get("id"),
        document_id: row.get("document_id"),
        line_no: row.get("line_no"),
        text: row.get("text"),
        embedding: row.get("embedding"),
    }
}
