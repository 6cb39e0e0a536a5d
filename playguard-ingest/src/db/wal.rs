//! Queries for the wal_entries table

use chrono::{DateTime, Utc};
use playguard_common::types::{WalEntry, WalStatus};
use playguard_common::{Error, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Aggregate WAL counters for operator visibility
#[derive(Debug, Clone, Default, Serialize)]
pub struct WalStats {
    pub pending: i64,
    pub committed: i64,
    pub failed: i64,
}

/// Append a serialized RawEvent for a server. Returns the assigned
/// sequence number. The event is considered ingested only after this
/// returns Ok.
pub async fn append(pool: &SqlitePool, server_id: Uuid, payload: &str) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO wal_entries (server_id, payload, status, created_at) VALUES (?, ?, 'pending', ?)",
    )
    .bind(server_id.to_string())
    .bind(payload)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| Error::WalAppend(e.to_string()))?;

    Ok(result.last_insert_rowid())
}

/// Oldest pending entries for one server, in strict sequence order.
pub async fn pending_for_server(
    pool: &SqlitePool,
    server_id: Uuid,
    limit: i64,
) -> Result<Vec<WalEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM wal_entries
        WHERE server_id = ? AND status = 'pending'
        ORDER BY seq ASC
        LIMIT ?
        "#,
    )
    .bind(server_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_entry).collect()
}

/// Number of entries still pending commit for a server.
pub async fn pending_count_for_server(pool: &SqlitePool, server_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM wal_entries WHERE server_id = ? AND status = 'pending'",
    )
    .bind(server_id.to_string())
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Servers that still have pending entries. Used by startup replay.
pub async fn pending_server_ids(pool: &SqlitePool) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT server_id FROM wal_entries WHERE status = 'pending'",
    )
    .fetch_all(pool)
    .await?;

    ids.iter()
        .map(|s| Uuid::parse_str(s).map_err(|e| Error::Internal(format!("bad server id: {}", e))))
        .collect()
}

/// Mark an entry committed after successful handoff to the resolver.
pub async fn mark_committed(pool: &SqlitePool, seq: i64) -> Result<()> {
    sqlx::query(
        "UPDATE wal_entries SET status = 'committed', last_attempt_at = ? WHERE seq = ?",
    )
    .bind(Utc::now())
    .bind(seq)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed commit attempt. Returns the new attempt count; the
/// caller decides when the cap is reached.
pub async fn record_failed_attempt(pool: &SqlitePool, seq: i64, error: &str) -> Result<i64> {
    let now = Utc::now();
    sqlx::query(
        r#"
        UPDATE wal_entries SET
            attempt_count = attempt_count + 1,
            first_attempt_at = COALESCE(first_attempt_at, ?),
            last_attempt_at = ?,
            last_error = ?
        WHERE seq = ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(error)
    .bind(seq)
    .execute(pool)
    .await?;

    let count: i64 = sqlx::query_scalar("SELECT attempt_count FROM wal_entries WHERE seq = ?")
        .bind(seq)
        .fetch_one(pool)
        .await?;

    Ok(count)
}

/// Mark an entry permanently failed after the retry cap. The entry is
/// preserved for operator inspection, never deleted here.
pub async fn mark_failed(pool: &SqlitePool, seq: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE wal_entries SET status = 'failed', last_attempt_at = ?, last_error = ? WHERE seq = ?",
    )
    .bind(Utc::now())
    .bind(error)
    .bind(seq)
    .execute(pool)
    .await?;

    Ok(())
}

/// Aggregate counters across all servers.
pub async fn stats(pool: &SqlitePool) -> Result<WalStats> {
    let rows = sqlx::query("SELECT status, COUNT(*) as n FROM wal_entries GROUP BY status")
        .fetch_all(pool)
        .await?;

    let mut stats = WalStats::default();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        match status.as_str() {
            "pending" => stats.pending = n,
            "committed" => stats.committed = n,
            "failed" => stats.failed = n,
            _ => {}
        }
    }

    Ok(stats)
}

/// Delete committed and permanently-failed entries older than the
/// cutoff. Pending entries are never removed.
pub async fn purge_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM wal_entries WHERE status IN ('committed', 'failed') AND created_at < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<WalEntry> {
    let server_id: String = row.try_get("server_id")?;
    let status: String = row.try_get("status")?;

    Ok(WalEntry {
        seq: row.try_get("seq")?,
        server_id: Uuid::parse_str(&server_id)
            .map_err(|e| Error::Internal(format!("bad server id: {}", e)))?,
        payload: row.try_get("payload")?,
        status: WalStatus::parse(&status)?,
        attempt_count: row.try_get("attempt_count")?,
        first_attempt_at: row.try_get("first_attempt_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}
