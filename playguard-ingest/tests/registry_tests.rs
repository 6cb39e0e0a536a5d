//! Server registry tests
//!
//! Covers declared immutability, administered CRUD, and the
//! deletion-with-pending-WAL rejection path.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use playguard_common::db::init::init_database;
use playguard_common::types::{
    IngestMode, Platform, RawEvent, ServerConfig, ServerSource, ServerStatus,
};
use playguard_common::events::EventBus;
use playguard_common::Error;
use sqlx::SqlitePool;
use uuid::Uuid;

use playguard_ingest::db::wal as wal_db;
use playguard_ingest::registry::Registry;
use playguard_ingest::wal::{Wal, WalConfig};

fn declared_server(name: &str) -> ServerConfig {
    ServerConfig {
        id: Uuid::new_v4(),
        platform: Platform::Plex,
        name: name.to_string(),
        base_url: "http://plex.local:32400".to_string(),
        source: ServerSource::Declared,
        enabled: true,
        webhook_enabled: true,
        realtime_enabled: true,
        polling_enabled: false,
        polling_interval_secs: 60,
    }
}

fn administered_server(name: &str) -> ServerConfig {
    ServerConfig {
        id: Uuid::new_v4(),
        platform: Platform::Jellyfin,
        name: name.to_string(),
        base_url: "http://jellyfin.local:8096".to_string(),
        source: ServerSource::Administered,
        enabled: true,
        webhook_enabled: false,
        realtime_enabled: false,
        polling_enabled: true,
        polling_interval_secs: 60,
    }
}

async fn setup(declared: Vec<ServerConfig>) -> (SqlitePool, Arc<Registry>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("registry.db")).await.unwrap();
    let registry = Registry::new(pool.clone(), declared, EventBus::new(64));
    (pool, registry, dir)
}

#[tokio::test]
async fn test_declared_servers_are_listed_and_immutable() {
    let declared = declared_server("living-room");
    let declared_id = declared.id;
    let (_pool, registry, _dir) = setup(vec![declared]).await;

    let servers = registry.list_servers().await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].source, ServerSource::Declared);

    // Mutation attempts against declared entries are rejected with the
    // immutable-config error, not applied.
    let mut edited = registry.get_server(declared_id).await.unwrap().unwrap();
    edited.name = "renamed".to_string();
    let err = registry.upsert_administered(edited).await.unwrap_err();
    assert!(matches!(err, Error::ImmutableConfig(_)));

    let err = registry.delete_administered(declared_id).await.unwrap_err();
    assert!(matches!(err, Error::ImmutableConfig(_)));

    // Unchanged.
    let unchanged = registry.get_server(declared_id).await.unwrap().unwrap();
    assert_eq!(unchanged.name, "living-room");
}

#[tokio::test]
async fn test_administered_server_crud() {
    let (_pool, registry, _dir) = setup(vec![]).await;

    let server = administered_server("attic");
    let server_id = server.id;
    registry.upsert_administered(server).await.unwrap();

    let fetched = registry.get_server(server_id).await.unwrap().unwrap();
    assert_eq!(fetched.name, "attic");
    assert_eq!(fetched.source, ServerSource::Administered);

    // Updates persist.
    let mut edited = fetched;
    edited.polling_interval_secs = 120;
    registry.upsert_administered(edited).await.unwrap();
    let fetched = registry.get_server(server_id).await.unwrap().unwrap();
    assert_eq!(fetched.polling_interval_secs, 120);

    // Deletion with no pending WAL entries succeeds.
    registry.delete_administered(server_id).await.unwrap();
    assert!(registry.get_server(server_id).await.unwrap().is_none());

    // Deleting again reports not-found.
    let err = registry.delete_administered(server_id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_upsert_validation() {
    let (_pool, registry, _dir) = setup(vec![]).await;

    let mut server = administered_server("bad");
    server.base_url = String::new();
    assert!(matches!(
        registry.upsert_administered(server).await.unwrap_err(),
        Error::InvalidInput(_)
    ));

    let mut server = administered_server("bad");
    server.polling_interval_secs = 0;
    assert!(matches!(
        registry.upsert_administered(server).await.unwrap_err(),
        Error::InvalidInput(_)
    ));
}

#[tokio::test]
async fn test_delete_rejected_while_wal_entries_pending() {
    let (pool, registry, _dir) = setup(vec![]).await;

    let server = administered_server("draining");
    let server_id = server.id;
    registry.upsert_administered(server).await.unwrap();

    // One event for this server still pending commit.
    let wal = Wal::new(pool.clone(), WalConfig::default());
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap();
    let seq = wal
        .append(&RawEvent {
            server_id,
            platform: Platform::Jellyfin,
            session_key: "sess-1".to_string(),
            user: "alice".to_string(),
            media_title: "Dune".to_string(),
            media_type: "movie".to_string(),
            started_at: start,
            stopped_at: None,
            ip_address: "203.0.113.9".to_string(),
            city: None,
            country: None,
            latitude: 0.0,
            longitude: 0.0,
            device: None,
            player: None,
            ingest_mode: IngestMode::Poll,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let err = registry.delete_administered(server_id).await.unwrap_err();
    assert!(matches!(err, Error::PendingWalEntries(_)));
    assert!(registry.get_server(server_id).await.unwrap().is_some(), "rejected deletion changes nothing");

    // Once the WAL drains, the same deletion goes through.
    wal_db::mark_committed(&pool, seq).await.unwrap();
    registry.delete_administered(server_id).await.unwrap();
    assert!(registry.get_server(server_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_status_updates_never_disable_a_server() {
    let (_pool, registry, _dir) = setup(vec![]).await;

    let server = administered_server("flaky");
    let server_id = server.id;
    registry.upsert_administered(server).await.unwrap();

    registry.set_status(server_id, ServerStatus::Error, Some("connection refused".into()));

    let health = registry.health_of(server_id);
    assert_eq!(health.status, ServerStatus::Error);
    assert_eq!(health.last_error.as_deref(), Some("connection refused"));

    // The configuration itself is untouched and still enabled.
    let config = registry.get_server(server_id).await.unwrap().unwrap();
    assert!(config.enabled);
}

#[tokio::test]
async fn test_test_connection_reports_unreachable() {
    let (_pool, registry, _dir) = setup(vec![]).await;

    let mut candidate = administered_server("probe");
    // Reserved TEST-NET address: nothing listens there.
    candidate.base_url = "http://192.0.2.1:1".to_string();

    let result = registry.test_connection(&candidate).await;
    assert!(!result.reachable);
    assert!(result.error.is_some());

    // Probing persists nothing.
    assert!(registry.get_server(candidate.id).await.unwrap().is_none());
}
