//! Append-only processing event store.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use kvitto_core::{
    EventRepository, EventStatus, NewEvent, ProcessingEvent, Result, Step,
};

/// PostgreSQL implementation of [`EventRepository`].
pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn record(&self, event: NewEvent) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let finished = !matches!(event.status, EventStatus::Started);

        sqlx::query(
            r#"INSERT INTO processing_events
               (id, document_id, step, status, finished_at, duration_ms, message)
               VALUES ($1, $2, $3, $4, CASE WHEN $5 THEN NOW() END, $6, $7)"#,
        )
        .bind(id)
        .bind(event.document_id)
        .bind(event.step.as_str())
        .bind(event.status.as_str())
        .bind(finished)
        .bind(event.duration_ms)
        .bind(&event.message)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<ProcessingEvent>> {
        let rows = sqlx::query(
            r#"SELECT id, document_id, step, status, started_at, finished_at,
                      duration_ms, message
               FROM processing_events
               WHERE document_id = $1
               ORDER BY started_at, id"#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ProcessingEvent {
                id: row.get("id"),
                document_id: row.get("document_id"),
                step: Step::from_str(row.get("step")).unwrap_or(Step::CollectFromDir),
                status: EventStatus::from_str(row.get("status"))
                    .unwrap_or(EventStatus::Error),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                duration_ms: row.get("duration_ms"),
                message: row.get("message"),
            })
            .collect())
    }
}
