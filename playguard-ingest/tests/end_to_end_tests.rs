//! End-to-end pipeline test
//!
//! Two servers report the same physical playback: a realtime push and
//! a 60-second poll. The push-sourced event must win deduplication,
//! the poll-sourced report must land in the audit trail, and an
//! administrator restore must produce a second independent event.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use playguard_common::db::init::init_database;
use playguard_common::events::EventBus;
use playguard_common::types::{
    AuditStatus, DedupLayer, DedupReason, IngestMode, Platform, RawEvent,
};
use uuid::Uuid;

use playguard_ingest::db::{audit as audit_db, events as events_db, rules as rules_db};
use playguard_ingest::dedup::{AuditFilter, Resolver};
use playguard_ingest::detect::DetectionEngine;
use playguard_ingest::state::PipelineSink;
use playguard_ingest::wal::{commit_pass, Wal, WalConfig};

#[tokio::test]
async fn test_push_beats_poll_and_restore_reverses_the_discard() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("e2e.db")).await.unwrap();
    rules_db::ensure_default_rules(&pool).await.unwrap();

    let event_bus = EventBus::new(256);
    let wal = Wal::new(pool.clone(), WalConfig::default());
    let resolver = Arc::new(Resolver::new(pool.clone(), 300, event_bus.clone()));
    let engine = Arc::new(DetectionEngine::new(pool.clone(), 50, event_bus));
    let sink = PipelineSink {
        resolver: Arc::clone(&resolver),
        engine,
    };

    let push_server = Uuid::new_v4();
    let poll_server = Uuid::new_v4();
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap();

    // The realtime push arrives first.
    let push_event = RawEvent {
        server_id: push_server,
        platform: Platform::Plex,
        session_key: "plex-42".to_string(),
        user: "alice".to_string(),
        media_title: "Dune".to_string(),
        media_type: "movie".to_string(),
        started_at: start,
        stopped_at: Some(start + Duration::minutes(90)),
        ip_address: "203.0.113.9".to_string(),
        city: Some("Lisbon".to_string()),
        country: Some("PT".to_string()),
        latitude: 38.7223,
        longitude: -9.1393,
        device: Some("Shield".to_string()),
        player: Some("Plex for Android".to_string()),
        ingest_mode: IngestMode::Realtime,
        received_at: start + Duration::seconds(1),
    };
    wal.append(&push_event).await.unwrap();
    let outcome = commit_pass(&pool, push_server, &sink, wal.config()).await.unwrap();
    assert_eq!(outcome.committed, 1);

    // The aggregator's 60-second poll reports the same playback with a
    // slightly shifted interval.
    let poll_event = RawEvent {
        server_id: poll_server,
        platform: Platform::Tautulli,
        session_key: "tautulli-9".to_string(),
        user: "alice".to_string(),
        media_title: "Dune".to_string(),
        media_type: "movie".to_string(),
        started_at: start + Duration::seconds(45),
        stopped_at: Some(start + Duration::minutes(91)),
        ip_address: "203.0.113.9".to_string(),
        city: Some("Lisbon".to_string()),
        country: Some("PT".to_string()),
        latitude: 38.7223,
        longitude: -9.1393,
        device: None,
        player: Some("Roku".to_string()),
        ingest_mode: IngestMode::Poll,
        received_at: start + Duration::seconds(60),
    };
    wal.append(&poll_event).await.unwrap();
    let outcome = commit_pass(&pool, poll_server, &sink, wal.config()).await.unwrap();
    assert_eq!(outcome.committed, 1, "duplicates still commit cleanly");

    // Exactly one canonical event for alice, sourced from the push.
    let canonicals = events_db::events_for_user_between(
        &pool,
        "alice",
        start - Duration::hours(1),
        start + Duration::hours(2),
    )
    .await
    .unwrap();
    assert_eq!(canonicals.len(), 1);
    let canonical = &canonicals[0];
    assert_eq!(canonical.dedup_layer, DedupLayer::RealtimePush);
    assert_eq!(canonical.raw.session_key, "plex-42");

    // The poll-sourced report is in the audit trail as a
    // lower-priority discard awaiting review.
    let (entries, total) = audit_db::list_audit_entries(&pool, &AuditFilter::default()).await.unwrap();
    assert_eq!(total, 1);
    let entry = &entries[0];
    assert_eq!(entry.reason, DedupReason::LowerPrioritySource);
    assert_eq!(entry.status, AuditStatus::PendingReview);
    assert_eq!(entry.canonical_event_id, canonical.id);
    assert_eq!(entry.discarded.session_key, "tautulli-9");

    // WAL bookkeeping: everything committed, nothing pending.
    let stats = wal.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.committed, 2);

    // The administrator disagrees with the discard and restores it.
    let restored = resolver.restore(entry.id, "operator").await.unwrap();

    // A second, independent PlaybackEvent now exists for alice.
    let all_events = events_db::events_for_user_between(
        &pool,
        "alice",
        start - Duration::hours(1),
        start + Duration::hours(2),
    )
    .await
    .unwrap();
    assert_eq!(all_events.len(), 2);
    assert!(all_events.iter().any(|e| e.id == canonical.id && !e.restored));
    assert!(all_events.iter().any(|e| e.id == restored.id && e.restored));

    // The audit entry records the reversal.
    let entry = audit_db::get_audit_entry(&pool, entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, AuditStatus::UserRestored);
    assert_eq!(entry.restored_event_id, Some(restored.id));

    // The original canonical event was never mutated by the restore.
    let canonical_after = events_db::get_playback_event(&pool, canonical.id).await.unwrap().unwrap();
    assert_eq!(canonical_after.raw.session_key, "plex-42");
    assert_eq!(canonical_after.dedup_layer, DedupLayer::RealtimePush);
}
