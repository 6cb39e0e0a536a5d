//! Queries for the dedup_audit_log table
//!
//! The audit log is an append-only ledger: entries are inserted when
//! the resolver discards a candidate and only their review status
//! changes afterwards, through explicit administrator actions.

use chrono::{DateTime, Utc};
use playguard_common::types::{AuditStatus, DedupAuditEntry, DedupLayer, DedupReason, RawEvent};
use playguard_common::{Error, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Insert a new audit entry with status pending_review.
pub async fn insert_audit_entry(pool: &SqlitePool, entry: &DedupAuditEntry) -> Result<()> {
    let payload = serde_json::to_string(&entry.discarded)
        .map_err(|e| Error::Internal(format!("serialize discarded event: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO dedup_audit_log (
            id, timestamp, discarded_payload, canonical_event_id, reason, dedup_layer,
            status, restored_event_id, user, media_title, resolved_by, resolved_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.id.to_string())
    .bind(entry.timestamp)
    .bind(payload)
    .bind(entry.canonical_event_id.to_string())
    .bind(entry.reason.as_str())
    .bind(entry.dedup_layer.as_str())
    .bind(entry.status.as_str())
    .bind(entry.restored_event_id.map(|id| id.to_string()))
    .bind(&entry.discarded.user)
    .bind(&entry.discarded.media_title)
    .bind(&entry.resolved_by)
    .bind(entry.resolved_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch one audit entry by id.
pub async fn get_audit_entry(pool: &SqlitePool, id: Uuid) -> Result<Option<DedupAuditEntry>> {
    let row = sqlx::query("SELECT * FROM dedup_audit_log WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_entry(&r)).transpose()
}

/// Record administrator agreement with a discard decision.
pub async fn mark_confirmed(pool: &SqlitePool, id: Uuid, resolved_by: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE dedup_audit_log
        SET status = 'user_confirmed', resolved_by = ?, resolved_at = ?
        WHERE id = ? AND status = 'pending_review'
        "#,
    )
    .bind(resolved_by)
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!(
            "audit entry {} not found or already resolved",
            id
        )));
    }

    Ok(())
}

/// Record an administrator restore, linking the newly created
/// independent event.
pub async fn mark_restored(
    pool: &SqlitePool,
    id: Uuid,
    resolved_by: &str,
    restored_event_id: Uuid,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE dedup_audit_log
        SET status = 'user_restored', resolved_by = ?, resolved_at = ?, restored_event_id = ?
        WHERE id = ? AND status = 'pending_review'
        "#,
    )
    .bind(resolved_by)
    .bind(Utc::now())
    .bind(restored_event_id.to_string())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!(
            "audit entry {} not found or already resolved",
            id
        )));
    }

    Ok(())
}

/// Filter options for listing audit entries
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub status: Option<AuditStatus>,
    pub user: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditFilter {
    fn normalized(&self) -> (i64, i64) {
        let limit = if self.limit <= 0 || self.limit > 1000 { 100 } else { self.limit };
        let offset = self.offset.max(0);
        (limit, offset)
    }
}

/// List audit entries with optional filtering, newest first. Returns
/// the page and the total matching count.
pub async fn list_audit_entries(
    pool: &SqlitePool,
    filter: &AuditFilter,
) -> Result<(Vec<DedupAuditEntry>, i64)> {
    let mut conditions = Vec::new();
    if filter.status.is_some() {
        conditions.push("status = ?");
    }
    if filter.user.is_some() {
        conditions.push("user = ?");
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM dedup_audit_log{}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(status) = filter.status {
        count_query = count_query.bind(status.as_str());
    }
    if let Some(user) = &filter.user {
        count_query = count_query.bind(user.clone());
    }
    let total = count_query.fetch_one(pool).await?;

    let (limit, offset) = filter.normalized();
    let list_sql = format!(
        "SELECT * FROM dedup_audit_log{} ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query(&list_sql);
    if let Some(status) = filter.status {
        list_query = list_query.bind(status.as_str());
    }
    if let Some(user) = &filter.user {
        list_query = list_query.bind(user.clone());
    }
    let rows = list_query.bind(limit).bind(offset).fetch_all(pool).await?;

    let entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>>>()?;
    Ok((entries, total))
}

/// Aggregate audit statistics for operator visibility
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total: i64,
    pub pending_review: i64,
    pub user_confirmed: i64,
    pub user_restored: i64,
    /// confirmed / (confirmed + restored), percent; None until an
    /// administrator has resolved at least one entry in the window
    pub accuracy_rate: Option<f64>,
}

/// Status counts and resolver accuracy over a rolling window.
///
/// Accuracy is exposed for operators only; it never changes resolver
/// behavior.
pub async fn audit_stats(pool: &SqlitePool, window_start: DateTime<Utc>) -> Result<AuditStats> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) as n FROM dedup_audit_log WHERE timestamp >= ? GROUP BY status",
    )
    .bind(window_start)
    .fetch_all(pool)
    .await?;

    let mut stats = AuditStats::default();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        stats.total += n;
        match status.as_str() {
            "pending_review" => stats.pending_review = n,
            "user_confirmed" => stats.user_confirmed = n,
            "user_restored" => stats.user_restored = n,
            _ => {}
        }
    }

    let resolved = stats.user_confirmed + stats.user_restored;
    if resolved > 0 {
        stats.accuracy_rate = Some(stats.user_confirmed as f64 / resolved as f64 * 100.0);
    }

    Ok(stats)
}

/// Retention sweep: delete resolved entries older than the cutoff.
/// Pending entries are always kept.
pub async fn purge_resolved_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM dedup_audit_log
        WHERE status IN ('user_confirmed', 'user_restored')
          AND resolved_at IS NOT NULL
          AND resolved_at < ?
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<DedupAuditEntry> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("discarded_payload")?;
    let canonical: String = row.try_get("canonical_event_id")?;
    let reason: String = row.try_get("reason")?;
    let layer: String = row.try_get("dedup_layer")?;
    let status: String = row.try_get("status")?;
    let restored: Option<String> = row.try_get("restored_event_id")?;

    let discarded: RawEvent = serde_json::from_str(&payload)
        .map_err(|e| Error::Internal(format!("bad discarded payload: {}", e)))?;

    Ok(DedupAuditEntry {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad audit id: {}", e)))?,
        timestamp: row.try_get("timestamp")?,
        discarded,
        canonical_event_id: Uuid::parse_str(&canonical)
            .map_err(|e| Error::Internal(format!("bad canonical id: {}", e)))?,
        reason: DedupReason::parse(&reason)?,
        dedup_layer: DedupLayer::parse(&layer)?,
        status: AuditStatus::parse(&status)?,
        restored_event_id: restored
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| Error::Internal(format!("bad restored id: {}", e)))?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}
