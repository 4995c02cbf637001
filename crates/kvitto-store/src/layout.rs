//! Fixed directory layout under the storage root.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use kvitto_core::Result;

/// Default intake area scanned by the directory adapter.
pub const INCOMING_DIR: &str = "incoming";

/// Rejected mailbox attachments land here for operator review.
pub const QUARANTINE_DIR: &str = "quarantine";

/// Dated bucket for accepted receipt files.
pub const BUCKET_DIR: &str = "receipts_raw";

/// Per-job operational log files.
pub const OPS_LOG_DIR: &str = "logs/ops";

/// Export artifacts (reports, dumps).
pub const EXPORTS_DIR: &str = "exports";

/// Filesystem lockfiles.
pub const LOCKS_DIR: &str = "locks";

/// Owns the storage root and its fixed subdirectories.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and all fixed subdirectories if absent.
    pub async fn ensure(&self) -> Result<()> {
        for dir in [
            INCOMING_DIR,
            QUARANTINE_DIR,
            BUCKET_DIR,
            OPS_LOG_DIR,
            EXPORTS_DIR,
            LOCKS_DIR,
        ] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    /// Root-relative dated bucket directory, `receipts_raw/<YYYY-MM-DD>`.
    pub fn bucket_dir(&self, date: NaiveDate) -> String {
        format!("{}/{}", BUCKET_DIR, date.format("%Y-%m-%d"))
    }

    /// Root-relative dated incoming directory for mailbox writes.
    pub fn incoming_dir(&self, date: NaiveDate) -> String {
        format!("{}/{}", INCOMING_DIR, date.format("%Y-%m-%d"))
    }

    /// Root-relative dated quarantine directory.
    pub fn quarantine_dir(&self, date: NaiveDate) -> String {
        format!("{}/{}", QUARANTINE_DIR, date.format("%Y-%m-%d"))
    }

    /// Absolute path of the per-job per-day ops log file.
    pub fn ops_log_path(&self, job_name: &str, date: NaiveDate, ext: &str) -> PathBuf {
        self.root
            .join(OPS_LOG_DIR)
            .join(format!("{}-{}.{}", job_name, date.format("%Y-%m-%d"), ext))
    }

    /// Absolute path of a named lockfile under `locks/`.
    pub fn lockfile_path(&self, name: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", name))
    }
}
