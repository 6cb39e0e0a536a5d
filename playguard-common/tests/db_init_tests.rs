//! Integration tests for database initialization
//!
//! Verifies automatic database creation, idempotent schema setup, and
//! default settings.

use playguard_common::db::init::{init_database, setting_i64};
use std::path::PathBuf;

fn temp_db_path(tag: &str) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/playguard-test-db-{}-{}.db",
        tag,
        std::process::id()
    ))
}

#[tokio::test]
async fn test_database_creation_when_missing() {
    let db_path = temp_db_path("create");
    let _ = std::fs::remove_file(&db_path);

    let result = init_database(&db_path).await;
    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_database_opens_existing() {
    let db_path = temp_db_path("existing");
    let _ = std::fs::remove_file(&db_path);

    let pool1 = init_database(&db_path).await;
    assert!(pool1.is_ok());

    // Second open must succeed against the existing schema
    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());

    drop(pool1);
    drop(pool2);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_default_settings_initialized() {
    let db_path = temp_db_path("settings");
    let _ = std::fs::remove_file(&db_path);

    let pool = init_database(&db_path).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM settings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(count >= 8, "Expected 8+ default settings, got {}", count);

    assert_eq!(setting_i64(&pool, "wal_max_attempts", 0).await, 5);
    assert_eq!(setting_i64(&pool, "trust_restricted_threshold", 0).await, 50);
    assert_eq!(setting_i64(&pool, "dedup_gap_seconds", 0).await, 300);

    // Missing key falls back to the caller's default
    assert_eq!(setting_i64(&pool, "no_such_setting", 42).await, 42);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_core_tables_exist() {
    let db_path = temp_db_path("tables");
    let _ = std::fs::remove_file(&db_path);

    let pool = init_database(&db_path).await.unwrap();

    for table in [
        "media_servers",
        "wal_entries",
        "playback_events",
        "dedup_audit_log",
        "detection_rules",
        "alerts",
        "user_trust",
    ] {
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(found, 1, "missing table {}", table);
    }

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}
