//! Database-wide advisory lock primitive for single-writer-per-job-name
//! coordination.
//!
//! The lock key is derived from the job name: first 8 bytes of its SHA-256
//! digest, read big-endian, reduced into the non-negative signed 64-bit
//! range (`pg_try_advisory_lock` takes a bigint). Locks are session-scoped:
//! they survive until explicitly released or until the holding connection's
//! session ends, which is what makes an abandoned holder crash-safe.

use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Row};
use tracing::debug;

use kvitto_core::Result;

/// Derive the advisory lock key for a job name.
///
/// Deterministic across processes and releases; collisions between distinct
/// job names are theoretical at this keyspace size.
pub fn advisory_key(job_name: &str) -> i64 {
    let digest = Sha256::digest(job_name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let raw = u64::from_be_bytes(bytes);
    (raw % (i64::MAX as u64)) as i64
}

/// Attempt to take the session-scoped advisory lock, without blocking.
///
/// Returns `true` when this session now holds the lock, `false` when
/// another session does.
pub async fn try_lock(conn: &mut PgConnection, key: i64) -> Result<bool> {
    let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
        .bind(key)
        .fetch_one(conn)
        .await?;
    let acquired: bool = row.get("acquired");
    debug!(
        subsystem = "db",
        component = "advisory",
        op = "try_lock",
        key,
        acquired,
        "Advisory lock attempt"
    );
    Ok(acquired)
}

/// Release a held advisory lock and close the session.
///
/// Closing matters even if the unlock statement fails: ending the session
/// releases everything it held.
pub async fn unlock_and_close(mut conn: PgConnection, key: i64) -> Result<()> {
    let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .execute(&mut conn)
        .await;
    let close = conn.close().await;
    unlock?;
    close?;
    Ok(())
}
