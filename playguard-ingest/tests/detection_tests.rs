//! Detection engine and rule tests

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use playguard_common::db::init::init_database;
use playguard_common::types::{
    DedupLayer, DetectionRule, IngestMode, Platform, PlaybackEvent, RawEvent, RuleType, Severity,
};
use playguard_common::events::EventBus;
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use playguard_ingest::db::{events as events_db, rules as rules_db, trust as trust_db};
use playguard_ingest::detect::rules::{
    check_concurrent_streams, check_device_velocity, check_geo_restriction,
    check_impossible_travel, check_simultaneous_locations, ConcurrentStreamsConfig,
    DeviceVelocityConfig, GeoRestrictionConfig, ImpossibleTravelConfig,
    SimultaneousLocationsConfig,
};
use playguard_ingest::detect::DetectionEngine;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap()
}

struct Location {
    lat: f64,
    lon: f64,
    country: &'static str,
}

fn make_playback(user: &str, start_min: i64, duration_min: i64, loc: Location, ip: &str) -> PlaybackEvent {
    let start = base_time() + Duration::minutes(start_min);
    PlaybackEvent {
        id: Uuid::new_v4(),
        raw: RawEvent {
            server_id: Uuid::new_v4(),
            platform: Platform::Plex,
            session_key: format!("sess-{}-{}", user, start_min),
            user: user.to_string(),
            media_title: "Dune".to_string(),
            media_type: "movie".to_string(),
            started_at: start,
            stopped_at: Some(start + Duration::minutes(duration_min)),
            ip_address: ip.to_string(),
            city: None,
            country: Some(loc.country.to_string()),
            latitude: loc.lat,
            longitude: loc.lon,
            device: None,
            player: None,
            ingest_mode: IngestMode::Realtime,
            received_at: start,
        },
        dedup_layer: DedupLayer::RealtimePush,
        restored: false,
        created_at: start,
    }
}

// ---------------------------------------------------------------------------
// Rule unit tests
// ---------------------------------------------------------------------------

#[test]
fn impossible_travel_fires_on_transcontinental_jump() {
    let config = ImpossibleTravelConfig {
        max_speed_kmh: 900.0,
        min_distance_km: 500.0,
        min_time_delta_minutes: 10,
    };

    // 36 degrees of latitude is roughly 4000 km; 30 minutes elapsed
    // implies about 8000 km/h.
    let previous = make_playback("alice", 0, 20, Location { lat: 0.0, lon: 0.0, country: "PT" }, "203.0.113.1");
    let current = make_playback("alice", 30, 20, Location { lat: 36.0, lon: 0.0, country: "ES" }, "203.0.113.2");

    let hit = check_impossible_travel(&config, &previous, &current).expect("rule must fire");
    let speed = hit.metadata["required_speed_kmh"].as_f64().unwrap();
    assert!(speed > 900.0, "implied speed should exceed the cap, got {}", speed);
    assert_eq!(hit.event_ids, vec![previous.id, current.id]);
}

#[test]
fn impossible_travel_distance_guard_suppresses_nearby_events() {
    let config = ImpossibleTravelConfig {
        max_speed_kmh: 900.0,
        min_distance_km: 500.0,
        min_time_delta_minutes: 10,
    };

    // 10 km apart, 5 minutes apart: both guards suppress the rule
    // regardless of implied speed.
    let previous = make_playback("alice", 0, 20, Location { lat: 0.0, lon: 0.0, country: "PT" }, "203.0.113.1");
    let current = make_playback("alice", 5, 20, Location { lat: 0.09, lon: 0.0, country: "PT" }, "203.0.113.2");

    assert!(check_impossible_travel(&config, &previous, &current).is_none());
}

#[test]
fn impossible_travel_skips_unknown_locations() {
    let config = ImpossibleTravelConfig::default();
    let previous = make_playback("alice", 0, 20, Location { lat: 0.0, lon: 0.0, country: "PT" }, "203.0.113.1");
    let current = make_playback("alice", 30, 20, Location { lat: 0.0, lon: 0.0, country: "ES" }, "203.0.113.2");

    // (0, 0) is the unknown-location sentinel.
    assert!(check_impossible_travel(&config, &previous, &current).is_none());
}

#[test]
fn concurrent_streams_fires_on_fourth_overlapping_session() {
    let config = ConcurrentStreamsConfig { default_limit: 3, user_limits: Default::default() };
    let current = make_playback("alice", 30, 60, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1");

    let two_others: Vec<_> = (0..2)
        .map(|i| make_playback("alice", i * 5, 120, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1"))
        .collect();
    assert!(
        check_concurrent_streams(&config, &two_others, &current).is_none(),
        "third session within the limit must not fire"
    );

    let three_others: Vec<_> = (0..3)
        .map(|i| make_playback("alice", i * 5, 120, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1"))
        .collect();
    let hit = check_concurrent_streams(&config, &three_others, &current)
        .expect("fourth overlapping session must fire");
    assert_eq!(hit.metadata["active_streams"], json!(4));
    assert_eq!(hit.metadata["stream_limit"], json!(3));
}

#[test]
fn concurrent_streams_honors_per_user_override() {
    let mut config = ConcurrentStreamsConfig::default();
    config.user_limits.insert("alice".to_string(), 1);

    let current = make_playback("alice", 10, 60, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1");
    let one_other = vec![make_playback("alice", 0, 60, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1")];

    assert!(check_concurrent_streams(&config, &one_other, &current).is_some());
}

#[test]
fn device_velocity_counts_distinct_addresses() {
    let config = DeviceVelocityConfig { window_minutes: 5, max_unique_ips: 3 };
    let current = make_playback("alice", 0, 60, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.4");

    let three = vec!["203.0.113.1".into(), "203.0.113.2".into(), "203.0.113.3".into()];
    assert!(check_device_velocity(&config, &three, &current).is_none());

    let four = vec![
        "203.0.113.1".into(),
        "203.0.113.2".into(),
        "203.0.113.3".into(),
        "203.0.113.4".into(),
    ];
    assert!(check_device_velocity(&config, &four, &current).is_some());
}

#[test]
fn geo_restriction_blocklist_and_allowlist() {
    let current = make_playback("alice", 0, 60, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1");

    let blocked = GeoRestrictionConfig {
        blocked_countries: vec!["PT".to_string()],
        allowed_countries: vec![],
    };
    assert!(check_geo_restriction(&blocked, &current).is_some());

    let allowlisted = GeoRestrictionConfig {
        blocked_countries: vec![],
        allowed_countries: vec!["US".to_string(), "GB".to_string()],
    };
    assert!(check_geo_restriction(&allowlisted, &current).is_some(), "PT is outside the allowlist");

    let permitted = GeoRestrictionConfig {
        blocked_countries: vec![],
        allowed_countries: vec!["PT".to_string()],
    };
    assert!(check_geo_restriction(&permitted, &current).is_none());

    let open = GeoRestrictionConfig::default();
    assert!(check_geo_restriction(&open, &current).is_none(), "empty lists never fire");
}

#[test]
fn simultaneous_locations_fires_on_distant_concurrent_session() {
    let config = SimultaneousLocationsConfig { window_minutes: 30, min_distance_km: 50.0 };

    // Lisbon and Madrid, 10 minutes apart: ~500 km.
    let current = make_playback("alice", 10, 60, Location { lat: 40.4168, lon: -3.7038, country: "ES" }, "203.0.113.2");
    let lisbon = vec![make_playback("alice", 0, 60, Location { lat: 38.7223, lon: -9.1393, country: "PT" }, "203.0.113.1")];
    assert!(check_simultaneous_locations(&config, &lisbon, &current).is_some());

    // Same city: under the distance floor.
    let nearby = vec![make_playback("alice", 0, 60, Location { lat: 40.42, lon: -3.70, country: "ES" }, "203.0.113.1")];
    assert!(check_simultaneous_locations(&config, &nearby, &current).is_none());

    // Outside the window.
    let stale = vec![make_playback("alice", -60, 30, Location { lat: 38.7223, lon: -9.1393, country: "PT" }, "203.0.113.1")];
    assert!(check_simultaneous_locations(&config, &stale, &current).is_none());
}

// ---------------------------------------------------------------------------
// Engine integration tests
// ---------------------------------------------------------------------------

async fn setup_engine() -> (SqlitePool, Arc<DetectionEngine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("detect.db")).await.unwrap();
    rules_db::ensure_default_rules(&pool).await.unwrap();
    let engine = Arc::new(DetectionEngine::new(pool.clone(), 50, EventBus::new(64)));
    (pool, engine, dir)
}

/// Disable every rule except the given one, which gets the provided
/// config and severity.
async fn solo_rule(pool: &SqlitePool, keep: RuleType, config: serde_json::Value, severity: Severity) {
    for rule in rules_db::list_rules(pool).await.unwrap() {
        let updated = DetectionRule {
            rule_type: rule.rule_type,
            enabled: rule.rule_type == keep,
            config: if rule.rule_type == keep { config.clone() } else { rule.config },
            severity: if rule.rule_type == keep { severity } else { rule.severity },
            updated_at: Utc::now(),
        };
        rules_db::update_rule(pool, &updated).await.unwrap();
    }
}

#[tokio::test]
async fn test_trust_score_strictly_decreases_and_floors_at_zero() {
    let (pool, engine, _dir) = setup_engine().await;
    solo_rule(
        &pool,
        RuleType::GeoRestriction,
        json!({ "blocked_countries": ["KP"], "allowed_countries": [] }),
        Severity::Critical,
    )
    .await;

    let mut last_score = 100;
    for i in 0..5 {
        let event = make_playback("mallory", i * 10, 5, Location { lat: 39.0, lon: 125.7, country: "KP" }, "203.0.113.1");
        events_db::insert_playback_event(&pool, &event).await.unwrap();

        let alerts = engine.submit(event).await.unwrap();
        assert_eq!(alerts.len(), 1, "geo restriction must fire each time");

        let trust = trust_db::get_trust(&pool, "mallory").await.unwrap().unwrap();
        assert!(
            trust.score < last_score,
            "score must strictly decrease: {} -> {}",
            last_score,
            trust.score
        );
        assert!(trust.score >= 0);
        last_score = trust.score;
    }

    let trust = trust_db::get_trust(&pool, "mallory").await.unwrap().unwrap();
    assert_eq!(trust.violation_count, 5);
    assert_eq!(trust.score, 100 - 5 * 15);
    assert!(trust.restricted, "score below 50 sets the advisory restricted flag");

    // Pile on enough violations to prove the floor.
    for i in 5..12 {
        let event = make_playback("mallory", i * 10, 5, Location { lat: 39.0, lon: 125.7, country: "KP" }, "203.0.113.1");
        events_db::insert_playback_event(&pool, &event).await.unwrap();
        engine.submit(event).await.unwrap();
    }
    let trust = trust_db::get_trust(&pool, "mallory").await.unwrap().unwrap();
    assert_eq!(trust.score, 0, "score never goes below zero");
}

#[tokio::test]
async fn test_trust_recovery_raises_scores_and_clears_restriction() {
    let (pool, engine, _dir) = setup_engine().await;
    solo_rule(
        &pool,
        RuleType::GeoRestriction,
        json!({ "blocked_countries": ["KP"], "allowed_countries": [] }),
        Severity::Critical,
    )
    .await;

    for i in 0..4 {
        let event = make_playback("mallory", i * 10, 5, Location { lat: 39.0, lon: 125.7, country: "KP" }, "203.0.113.1");
        events_db::insert_playback_event(&pool, &event).await.unwrap();
        engine.submit(event).await.unwrap();
    }

    let trust = trust_db::get_trust(&pool, "mallory").await.unwrap().unwrap();
    assert_eq!(trust.score, 40);
    assert!(trust.restricted);

    // One recovery pass of 10 points brings the score to the threshold
    // and clears the advisory flag.
    trust_db::recover_scores(&pool, 10, 50).await.unwrap();
    let trust = trust_db::get_trust(&pool, "mallory").await.unwrap().unwrap();
    assert_eq!(trust.score, 50);
    assert!(!trust.restricted);

    // Recovery caps at 100.
    for _ in 0..20 {
        trust_db::recover_scores(&pool, 10, 50).await.unwrap();
    }
    let trust = trust_db::get_trust(&pool, "mallory").await.unwrap().unwrap();
    assert_eq!(trust.score, 100);
}

#[tokio::test]
async fn test_impossible_travel_through_engine() {
    let (pool, engine, _dir) = setup_engine().await;
    solo_rule(
        &pool,
        RuleType::ImpossibleTravel,
        json!({ "max_speed_kmh": 900.0, "min_distance_km": 500.0, "min_time_delta_minutes": 10 }),
        Severity::Critical,
    )
    .await;

    let lisbon = make_playback("alice", 0, 20, Location { lat: 38.7223, lon: -9.1393, country: "PT" }, "203.0.113.1");
    events_db::insert_playback_event(&pool, &lisbon).await.unwrap();
    let alerts = engine.submit(lisbon).await.unwrap();
    assert!(alerts.is_empty(), "first event has no history to violate");

    // New York, 30 minutes later.
    let new_york = make_playback("alice", 30, 20, Location { lat: 40.7128, lon: -74.0060, country: "US" }, "198.51.100.1");
    events_db::insert_playback_event(&pool, &new_york).await.unwrap();
    let alerts = engine.submit(new_york).await.unwrap();

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_type, RuleType::ImpossibleTravel);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].user, "alice");
}

#[tokio::test]
async fn test_rule_failure_is_isolated_from_other_rules() {
    let (pool, engine, _dir) = setup_engine().await;

    // Geo restriction is valid and should still fire even though the
    // impossible-travel config is unparseable.
    solo_rule(
        &pool,
        RuleType::GeoRestriction,
        json!({ "blocked_countries": ["KP"], "allowed_countries": [] }),
        Severity::Warning,
    )
    .await;
    let broken = DetectionRule {
        rule_type: RuleType::ImpossibleTravel,
        enabled: true,
        config: json!({ "max_speed_kmh": "very fast" }),
        severity: Severity::Critical,
        updated_at: Utc::now(),
    };
    rules_db::update_rule(&pool, &broken).await.unwrap();

    let previous = make_playback("mallory", 0, 5, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1");
    events_db::insert_playback_event(&pool, &previous).await.unwrap();
    let event = make_playback("mallory", 30, 5, Location { lat: 39.0, lon: 125.7, country: "KP" }, "203.0.113.1");
    events_db::insert_playback_event(&pool, &event).await.unwrap();

    let alerts = engine.submit(event).await.unwrap();
    assert_eq!(alerts.len(), 1, "healthy rule still runs");
    assert_eq!(alerts[0].rule_type, RuleType::GeoRestriction);

    let metrics = engine.metrics();
    assert!(metrics.detection_errors >= 1, "broken rule counted in metrics");
}

#[tokio::test]
async fn test_rule_config_change_applies_to_next_event_only() {
    let (pool, engine, _dir) = setup_engine().await;
    solo_rule(
        &pool,
        RuleType::GeoRestriction,
        json!({ "blocked_countries": [], "allowed_countries": [] }),
        Severity::Warning,
    )
    .await;

    let first = make_playback("alice", 0, 5, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1");
    events_db::insert_playback_event(&pool, &first).await.unwrap();
    assert!(engine.submit(first).await.unwrap().is_empty());

    // Tighten the rule; only events evaluated from now on see it.
    solo_rule(
        &pool,
        RuleType::GeoRestriction,
        json!({ "blocked_countries": ["PT"], "allowed_countries": [] }),
        Severity::Warning,
    )
    .await;

    let second = make_playback("alice", 10, 5, Location { lat: 38.7, lon: -9.1, country: "PT" }, "203.0.113.1");
    events_db::insert_playback_event(&pool, &second).await.unwrap();
    let alerts = engine.submit(second).await.unwrap();
    assert_eq!(alerts.len(), 1);

    // The earlier event was never retroactively re-evaluated: exactly
    // one alert exists.
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(total, 1);
}
