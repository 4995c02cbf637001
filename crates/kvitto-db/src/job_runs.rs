//! Durable job run bookkeeping.
//!
//! Metric writes are individual jsonb UPDATEs so a crash mid-run leaves the
//! metrics written so far visible to operators.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use kvitto_core::{
    Error, JobRun, JobRunRepository, JobStatus, NewJobRun, Result, TriggeredBy,
};

const JOB_RUN_COLUMNS: &str = r#"id, job_name, status, triggered_by, params, metrics,
    log_path, error_message, started_at, finished_at"#;

/// PostgreSQL implementation of [`JobRunRepository`].
pub struct PgJobRunRepository {
    pool: PgPool,
}

impl PgJobRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRunRepository for PgJobRunRepository {
    async fn create(&self, req: NewJobRun) -> Result<JobRun> {
        let id = Uuid::now_v7();
        let finished_at_now = !matches!(req.status, JobStatus::Running);

        let row = sqlx::query(&format!(
            r#"INSERT INTO job_runs
               (id, job_name, status, triggered_by, params, log_path, finished_at)
               VALUES ($1, $2, $3, $4, $5, $6, CASE WHEN $7 THEN NOW() END)
               RETURNING {JOB_RUN_COLUMNS}"#
        ))
        .bind(id)
        .bind(&req.job_name)
        .bind(req.status.as_str())
        .bind(req.triggered_by.as_str())
        .bind(&req.params)
        .bind(&req.log_path)
        .bind(finished_at_now)
        .fetch_one(&self.pool)
        .await?;

        job_run_from_row(&row)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        // Guarded on `running` so a terminal status is written exactly once.
        let result = sqlx::query(
            r#"UPDATE job_runs
               SET status = $2, error_message = COALESCE($3, ''), finished_at = NOW()
               WHERE id = $1 AND status = 'running'"#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Job(format!(
                "job run {} is not in running state",
                id
            )));
        }
        Ok(())
    }

    async fn set_metric(&self, id: Uuid, key: &str, value: JsonValue) -> Result<()> {
        sqlx::query(
            r#"UPDATE job_runs
               SET metrics = jsonb_set(metrics, ARRAY[$2], $3::jsonb, true)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn inc_metric(&self, id: Uuid, key: &str, by: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE job_runs
               SET metrics = jsonb_set(
                   metrics, ARRAY[$2],
                   to_jsonb(COALESCE((metrics->>$2)::bigint, 0) + $3), true)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(key)
        .bind(by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<JobRun> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Job run {} not found", id)))?;

        job_run_from_row(&row)
    }
}

fn job_run_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRun> {
    Ok(JobRun {
        id: row.get("id"),
        job_name: row.get("job_name"),
        status: JobStatus::from_str(row.get("status")).unwrap_or(JobStatus::Failed),
        triggered_by: TriggeredBy::from_str(row.get("triggered_by"))
            .unwrap_or(TriggeredBy::System),
        params: row.get("params"),
        metrics: row.get("metrics"),
        log_path: row.get("log_path"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}
