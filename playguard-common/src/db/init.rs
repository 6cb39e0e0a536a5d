//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up
//! idempotently. All tables use `CREATE TABLE IF NOT EXISTS` so
//! initialization is safe to repeat on every startup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize the database connection pool and create tables if needed.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL journal mode allows concurrent readers with one writer,
    // needed because the read API runs alongside the commit workers.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_settings_table(&pool).await?;
    create_media_servers_table(&pool).await?;
    create_wal_entries_table(&pool).await?;
    create_playback_events_table(&pool).await?;
    create_dedup_audit_log_table(&pool).await?;
    create_detection_rules_table(&pool).await?;
    create_alerts_table(&pool).await?;
    create_user_trust_table(&pool).await?;

    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create the settings table
///
/// Stores pipeline configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize default settings.
///
/// Ensures all required settings exist; existing values are preserved.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // WAL commit behavior
    ensure_setting(pool, "wal_max_attempts", "5").await?;
    ensure_setting(pool, "wal_batch_size", "64").await?;
    ensure_setting(pool, "wal_retention_days", "7").await?;

    // Dedup resolver
    ensure_setting(pool, "dedup_gap_seconds", "300").await?;
    ensure_setting(pool, "audit_retention_days", "90").await?;

    // Trust ledger
    ensure_setting(pool, "trust_restricted_threshold", "50").await?;
    ensure_setting(pool, "trust_recovery_per_day", "1").await?;
    ensure_setting(pool, "trust_recovery_interval_secs", "86400").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // INSERT OR IGNORE handles concurrent initialization races
    sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(default_value)
        .execute(pool)
        .await?;

    Ok(())
}

/// Read a setting as i64, falling back to the given default.
pub async fn setting_i64(pool: &SqlitePool, key: &str, default: i64) -> i64 {
    sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Create the media_servers table
///
/// Holds administered server configurations. Declared servers come
/// from the config file and have no row here.
pub async fn create_media_servers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media_servers (
            id TEXT PRIMARY KEY,
            platform TEXT NOT NULL CHECK (platform IN ('plex', 'jellyfin', 'tautulli')),
            name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            webhook_enabled INTEGER NOT NULL DEFAULT 0,
            realtime_enabled INTEGER NOT NULL DEFAULT 0,
            polling_enabled INTEGER NOT NULL DEFAULT 0,
            polling_interval_secs INTEGER NOT NULL DEFAULT 60,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (polling_interval_secs > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the wal_entries table
///
/// Append-only durability queue. `seq` is globally unique and strictly
/// increasing; per-server commit order follows it.
pub async fn create_wal_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wal_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            server_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'committed', 'failed')),
            attempt_count INTEGER NOT NULL DEFAULT 0,
            first_attempt_at TIMESTAMP,
            last_attempt_at TIMESTAMP,
            last_error TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_wal_entries_server_status ON wal_entries(server_id, status, seq)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the playback_events table
///
/// Canonical, deduplicated playback events.
pub async fn create_playback_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playback_events (
            id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            platform TEXT NOT NULL CHECK (platform IN ('plex', 'jellyfin', 'tautulli')),
            session_key TEXT NOT NULL,
            user TEXT NOT NULL,
            media_title TEXT NOT NULL,
            media_type TEXT NOT NULL,
            started_at TIMESTAMP NOT NULL,
            stopped_at TIMESTAMP,
            ip_address TEXT NOT NULL,
            city TEXT,
            country TEXT,
            latitude REAL NOT NULL DEFAULT 0,
            longitude REAL NOT NULL DEFAULT 0,
            device TEXT,
            player TEXT,
            ingest_mode TEXT NOT NULL CHECK (ingest_mode IN ('webhook', 'realtime', 'poll')),
            dedup_layer TEXT NOT NULL CHECK (dedup_layer IN ('realtime_push', 'webhook', 'direct_poll', 'aggregator_poll')),
            restored INTEGER NOT NULL DEFAULT 0,
            received_at TIMESTAMP NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (stopped_at IS NULL OR stopped_at >= started_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_playback_events_user_started ON playback_events(user, started_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_playback_events_server ON playback_events(server_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the dedup_audit_log table
///
/// Permanent audit trail of discard decisions. Entries are never
/// deleted by the pipeline; only an operator retention sweep removes
/// resolved entries past the retention window.
pub async fn create_dedup_audit_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedup_audit_log (
            id TEXT PRIMARY KEY,
            timestamp TIMESTAMP NOT NULL,
            discarded_payload TEXT NOT NULL,
            canonical_event_id TEXT NOT NULL,
            reason TEXT NOT NULL CHECK (reason IN ('exact_duplicate', 'overlapping_session', 'lower_priority_source')),
            dedup_layer TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending_review' CHECK (status IN ('pending_review', 'user_confirmed', 'user_restored')),
            restored_event_id TEXT,
            user TEXT NOT NULL,
            media_title TEXT NOT NULL,
            resolved_by TEXT,
            resolved_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dedup_audit_status ON dedup_audit_log(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dedup_audit_user ON dedup_audit_log(user)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dedup_audit_canonical ON dedup_audit_log(canonical_event_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the detection_rules table
pub async fn create_detection_rules_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detection_rules (
            rule_type TEXT PRIMARY KEY CHECK (rule_type IN (
                'impossible_travel', 'concurrent_streams', 'device_velocity',
                'geo_restriction', 'simultaneous_locations'
            )),
            enabled INTEGER NOT NULL DEFAULT 1,
            config TEXT NOT NULL DEFAULT '{}',
            severity TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'critical')),
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the alerts table
pub async fn create_alerts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            rule_type TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'critical')),
            user TEXT NOT NULL,
            server_id TEXT,
            event_ids TEXT NOT NULL DEFAULT '[]',
            message TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            acknowledged INTEGER NOT NULL DEFAULT 0,
            acknowledged_by TEXT,
            acknowledged_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_user ON alerts(user)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_acknowledged ON alerts(acknowledged)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the user_trust table
pub async fn create_user_trust_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_trust (
            user TEXT PRIMARY KEY,
            score INTEGER NOT NULL DEFAULT 100,
            violation_count INTEGER NOT NULL DEFAULT 0,
            restricted INTEGER NOT NULL DEFAULT 0,
            last_violation_at TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (score >= 0 AND score <= 100)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
