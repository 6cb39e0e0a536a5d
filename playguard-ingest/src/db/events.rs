//! Queries for the playback_events table (canonical events)

use chrono::{DateTime, Utc};
use playguard_common::types::{DedupLayer, IngestMode, Platform, PlaybackEvent, RawEvent};
use playguard_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Insert a canonical playback event.
pub async fn insert_playback_event(pool: &SqlitePool, event: &PlaybackEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO playback_events (
            id, server_id, platform, session_key, user, media_title, media_type,
            started_at, stopped_at, ip_address, city, country, latitude, longitude,
            device, player, ingest_mode, dedup_layer, restored, received_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.id.to_string())
    .bind(event.raw.server_id.to_string())
    .bind(event.raw.platform.as_str())
    .bind(&event.raw.session_key)
    .bind(&event.raw.user)
    .bind(&event.raw.media_title)
    .bind(&event.raw.media_type)
    .bind(event.raw.started_at)
    .bind(event.raw.stopped_at)
    .bind(&event.raw.ip_address)
    .bind(&event.raw.city)
    .bind(&event.raw.country)
    .bind(event.raw.latitude)
    .bind(event.raw.longitude)
    .bind(&event.raw.device)
    .bind(&event.raw.player)
    .bind(event.raw.ingest_mode.as_str())
    .bind(event.dedup_layer.as_str())
    .bind(event.restored as i64)
    .bind(event.raw.received_at)
    .bind(event.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch one canonical event by id.
pub async fn get_playback_event(pool: &SqlitePool, id: Uuid) -> Result<Option<PlaybackEvent>> {
    let row = sqlx::query("SELECT * FROM playback_events WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_event(&r)).transpose()
}

/// Remove a canonical event. Only the dedup resolver calls this, when
/// a higher-priority candidate demotes the previous canonical.
pub async fn delete_playback_event(pool: &SqlitePool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM playback_events WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Candidate events for dedup grouping: same user and media title,
/// not restored, started within the given window. Interval overlap is
/// decided by the resolver.
pub async fn dedup_candidates(
    pool: &SqlitePool,
    user: &str,
    media_title: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<Vec<PlaybackEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM playback_events
        WHERE user = ? AND media_title = ? AND restored = 0
          AND started_at >= ? AND started_at <= ?
        ORDER BY started_at ASC
        "#,
    )
    .bind(user)
    .bind(media_title)
    .bind(window_start)
    .bind(window_end)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_event).collect()
}

/// Most recent event for a user that started strictly before the given
/// event (by start timestamp, excluding the event itself).
pub async fn last_event_for_user(
    pool: &SqlitePool,
    user: &str,
    before: DateTime<Utc>,
    exclude: Uuid,
) -> Result<Option<PlaybackEvent>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM playback_events
        WHERE user = ? AND started_at <= ? AND id != ?
        ORDER BY started_at DESC, created_at DESC
        LIMIT 1
        "#,
    )
    .bind(user)
    .bind(before)
    .bind(exclude.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|r| row_to_event(&r)).transpose()
}

/// All events for a user whose start timestamp lies in [from, to].
pub async fn events_for_user_between(
    pool: &SqlitePool,
    user: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<PlaybackEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM playback_events
        WHERE user = ? AND started_at >= ? AND started_at <= ?
        ORDER BY started_at ASC
        "#,
    )
    .bind(user)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_event).collect()
}

/// Distinct network addresses seen for a user since the given instant.
pub async fn distinct_ips_since(
    pool: &SqlitePool,
    user: &str,
    since: DateTime<Utc>,
) -> Result<Vec<String>> {
    let ips = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT ip_address FROM playback_events WHERE user = ? AND started_at >= ?",
    )
    .bind(user)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(ips)
}

pub(crate) fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<PlaybackEvent> {
    let id: String = row.try_get("id")?;
    let server_id: String = row.try_get("server_id")?;
    let platform: String = row.try_get("platform")?;
    let ingest_mode: String = row.try_get("ingest_mode")?;
    let dedup_layer: String = row.try_get("dedup_layer")?;
    let restored: i64 = row.try_get("restored")?;

    Ok(PlaybackEvent {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad event id: {}", e)))?,
        raw: RawEvent {
            server_id: Uuid::parse_str(&server_id)
                .map_err(|e| Error::Internal(format!("bad server id: {}", e)))?,
            platform: Platform::parse(&platform)?,
            session_key: row.try_get("session_key")?,
            user: row.try_get("user")?,
            media_title: row.try_get("media_title")?,
            media_type: row.try_get("media_type")?,
            started_at: row.try_get("started_at")?,
            stopped_at: row.try_get("stopped_at")?,
            ip_address: row.try_get("ip_address")?,
            city: row.try_get("city")?,
            country: row.try_get("country")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            device: row.try_get("device")?,
            player: row.try_get("player")?,
            ingest_mode: IngestMode::parse(&ingest_mode)?,
            received_at: row.try_get("received_at")?,
        },
        dedup_layer: DedupLayer::parse(&dedup_layer)?,
        restored: restored != 0,
        created_at: row.try_get("created_at")?,
    })
}
