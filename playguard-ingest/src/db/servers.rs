//! Queries for the media_servers table (administered servers only)
//!
//! Declared servers are loaded from the config file and never touch
//! this table.

use chrono::Utc;
use playguard_common::types::{Platform, ServerConfig, ServerSource};
use playguard_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Insert or update an administered server row.
pub async fn upsert_server(pool: &SqlitePool, config: &ServerConfig) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO media_servers (
            id, platform, name, base_url, enabled,
            webhook_enabled, realtime_enabled, polling_enabled, polling_interval_secs,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            platform = excluded.platform,
            name = excluded.name,
            base_url = excluded.base_url,
            enabled = excluded.enabled,
            webhook_enabled = excluded.webhook_enabled,
            realtime_enabled = excluded.realtime_enabled,
            polling_enabled = excluded.polling_enabled,
            polling_interval_secs = excluded.polling_interval_secs,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(config.id.to_string())
    .bind(config.platform.as_str())
    .bind(&config.name)
    .bind(&config.base_url)
    .bind(config.enabled as i64)
    .bind(config.webhook_enabled as i64)
    .bind(config.realtime_enabled as i64)
    .bind(config.polling_enabled as i64)
    .bind(config.polling_interval_secs as i64)
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// All administered server rows.
pub async fn list_servers(pool: &SqlitePool) -> Result<Vec<ServerConfig>> {
    let rows = sqlx::query("SELECT * FROM media_servers ORDER BY name ASC")
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_server).collect()
}

/// One administered server by id.
pub async fn get_server(pool: &SqlitePool, id: Uuid) -> Result<Option<ServerConfig>> {
    let row = sqlx::query("SELECT * FROM media_servers WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_server(&r)).transpose()
}

/// Delete an administered server row. Registry-level guards (declared
/// immutability, pending WAL entries) run before this.
pub async fn delete_server(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM media_servers WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn row_to_server(row: &sqlx::sqlite::SqliteRow) -> Result<ServerConfig> {
    let id: String = row.try_get("id")?;
    let platform: String = row.try_get("platform")?;
    let enabled: i64 = row.try_get("enabled")?;
    let webhook_enabled: i64 = row.try_get("webhook_enabled")?;
    let realtime_enabled: i64 = row.try_get("realtime_enabled")?;
    let polling_enabled: i64 = row.try_get("polling_enabled")?;
    let polling_interval_secs: i64 = row.try_get("polling_interval_secs")?;

    Ok(ServerConfig {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad server id: {}", e)))?,
        platform: Platform::parse(&platform)?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        source: ServerSource::Administered,
        enabled: enabled != 0,
        webhook_enabled: webhook_enabled != 0,
        realtime_enabled: realtime_enabled != 0,
        polling_enabled: polling_enabled != 0,
        polling_interval_secs: polling_interval_secs.max(1) as u64,
    })
}
