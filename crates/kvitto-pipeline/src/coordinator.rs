//! Single-writer-per-job-name coordination with durable run bookkeeping.
//!
//! Every pipeline invocation runs inside a [`JobContext`]: one JobRun row,
//! one per-job-per-day log file, and (when enabled) one database-wide
//! advisory lock. The lock lives on a dedicated connection owned by the
//! context, not a pooled one: if the process dies mid-run the connection is
//! torn down, the server ends the session, and the lock is released without
//! any cleanup code running.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tracing::{error, info, warn};
use uuid::Uuid;

use kvitto_core::{
    Error, JobRunRepository, JobStatus, NewJobRun, Result, RunSummary, TriggeredBy,
};
use kvitto_db::advisory;
use kvitto_store::StorageLayout;

/// Outcome of attempting to start a coordinated run.
pub enum BeginOutcome {
    /// The lock (if requested) was acquired; the run is `running`.
    Started(JobContext),
    /// Another run of the same job name holds the lock. A `skipped` row was
    /// recorded; callers should return this summary and do no work.
    Skipped(RunSummary),
}

/// Factory for coordinated job contexts.
pub struct JobCoordinator {
    job_runs: Arc<dyn JobRunRepository>,
    layout: StorageLayout,
    /// Connection URL for dedicated lock sessions. Absent in unit tests,
    /// which run without advisory locking.
    lock_database_url: Option<String>,
}

impl JobCoordinator {
    pub fn new(job_runs: Arc<dyn JobRunRepository>, layout: StorageLayout) -> Self {
        Self {
            job_runs,
            layout,
            lock_database_url: None,
        }
    }

    /// Enable advisory locking, taking lock sessions from this URL.
    pub fn with_advisory_lock(mut self, database_url: impl Into<String>) -> Self {
        self.lock_database_url = Some(database_url.into());
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Start a coordinated run.
    ///
    /// With `use_lock`, the job-name advisory lock is tried without
    /// blocking; a busy lock records a `skipped` JobRun and returns
    /// [`BeginOutcome::Skipped`]. Otherwise a `running` row is created and
    /// the per-day log file opened.
    pub async fn begin(
        &self,
        job_name: &str,
        params: JsonValue,
        triggered_by: TriggeredBy,
        use_lock: bool,
    ) -> Result<BeginOutcome> {
        let lock = if use_lock {
            match &self.lock_database_url {
                Some(url) => {
                    let key = advisory::advisory_key(job_name);
                    let mut conn = PgConnection::connect(url).await?;
                    if advisory::try_lock(&mut conn, key).await? {
                        Some((conn, key))
                    } else {
                        let _ = conn.close().await;
                        let summary = self
                            .record_skipped(job_name, params, triggered_by)
                            .await?;
                        return Ok(BeginOutcome::Skipped(summary));
                    }
                }
                None => None,
            }
        } else {
            None
        };

        let log_path = self
            .layout
            .ops_log_path(job_name, Utc::now().date_naive(), "log");
        let run = self
            .job_runs
            .create(NewJobRun {
                job_name: job_name.to_string(),
                status: JobStatus::Running,
                triggered_by,
                params,
                log_path: log_path.display().to_string(),
            })
            .await?;

        let logger = JobLogger::open(log_path)?;
        info!(
            subsystem = "pipeline",
            component = "coordinator",
            op = "begin",
            job_name,
            jobrun_id = %run.id,
            "Job run started"
        );

        let mut ctx = JobContext {
            run_id: run.id,
            job_name: job_name.to_string(),
            job_runs: Arc::clone(&self.job_runs),
            logger,
            lock,
        };
        ctx.log_info(&format!("run {} started", run.id));
        Ok(BeginOutcome::Started(ctx))
    }

    /// Record a `skipped` run without doing any work (lock busy, or the
    /// mailbox filesystem lockfile was present).
    pub async fn record_skipped(
        &self,
        job_name: &str,
        params: JsonValue,
        triggered_by: TriggeredBy,
    ) -> Result<RunSummary> {
        let run = self
            .job_runs
            .create(NewJobRun {
                job_name: job_name.to_string(),
                status: JobStatus::Skipped,
                triggered_by,
                params,
                log_path: String::new(),
            })
            .await?;
        warn!(
            subsystem = "pipeline",
            component = "coordinator",
            op = "skip",
            job_name,
            jobrun_id = %run.id,
            "Job skipped: another run holds the lock"
        );
        Ok(RunSummary {
            jobrun_id: run.id,
            status: JobStatus::Skipped,
            metrics: run.metrics,
            log_path: run.log_path,
        })
    }
}

/// Scoped state of one running job: metrics sink, log sink, lock session.
pub struct JobContext {
    run_id: Uuid,
    job_name: String,
    job_runs: Arc<dyn JobRunRepository>,
    logger: JobLogger,
    lock: Option<(PgConnection, i64)>,
}

impl JobContext {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Set one metric. Each call is its own durable write.
    pub async fn set_metric(&self, key: &str, value: JsonValue) -> Result<()> {
        self.job_runs.set_metric(self.run_id, key, value).await
    }

    /// Increment one integer metric, durably.
    pub async fn inc_metric(&self, key: &str, by: i64) -> Result<()> {
        self.job_runs.inc_metric(self.run_id, key, by).await
    }

    /// Append to the job log file and mirror to tracing at info level.
    pub fn log_info(&mut self, message: &str) {
        info!(
            subsystem = "pipeline",
            job_name = %self.job_name,
            jobrun_id = %self.run_id,
            "{}",
            message
        );
        self.logger.write_line("INFO", message);
    }

    /// Append to the job log file and mirror to tracing at error level.
    pub fn log_error(&mut self, message: &str) {
        error!(
            subsystem = "pipeline",
            job_name = %self.job_name,
            jobrun_id = %self.run_id,
            "{}",
            message
        );
        self.logger.write_line("ERROR", message);
    }

    /// Finish successfully: terminal status, log flushed, lock released.
    pub async fn complete(mut self) -> Result<RunSummary> {
        self.log_info("run completed");
        self.finish(JobStatus::Success, None).await
    }

    /// Finish as failed, capturing the error message. The caller re-raises
    /// the original error after recording it.
    pub async fn fail(mut self, err: &Error) -> Result<RunSummary> {
        let message = err.to_string();
        self.log_error(&format!("run failed: {}", message));
        self.finish(JobStatus::Failed, Some(message)).await
    }

    async fn finish(mut self, status: JobStatus, error_message: Option<String>) -> Result<RunSummary> {
        self.logger.flush();
        self.job_runs
            .finish(self.run_id, status, error_message.as_deref())
            .await?;

        if let Some((conn, key)) = self.lock.take() {
            advisory::unlock_and_close(conn, key).await?;
        }

        let run = self.job_runs.get(self.run_id).await?;
        Ok(RunSummary {
            jobrun_id: run.id,
            status: run.status,
            metrics: run.metrics,
            log_path: run.log_path,
        })
    }
}

/// Line-oriented append-only log sink, one file per job name per day.
struct JobLogger {
    file: std::fs::File,
    path: PathBuf,
}

impl JobLogger {
    fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    fn write_line(&mut self, level: &str, message: &str) {
        let line = format!(
            "{} [{}] {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message
        );
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            warn!(path = %self.path.display(), error = %e, "job log write failed");
        }
    }

    fn flush(&mut self) {
        let _ = self.file.flush();
    }
}
