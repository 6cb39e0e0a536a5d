//! HTTP API integration tests
//!
//! Drives the router directly with tower's oneshot so no socket is
//! needed: health, admin CRUD with the immutable-config rejection,
//! webhook ingestion, and rule updates.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use playguard_common::db::init::init_database;
use playguard_common::events::EventBus;
use playguard_common::types::{Platform, ServerConfig, ServerSource};

use playguard_ingest::api::{self, sse::SseBroadcaster};
use playguard_ingest::db::rules as rules_db;
use playguard_ingest::dedup::Resolver;
use playguard_ingest::detect::DetectionEngine;
use playguard_ingest::ingest::Orchestrator;
use playguard_ingest::registry::Registry;
use playguard_ingest::state::{AppState, PipelineSink};
use playguard_ingest::wal::{Wal, WalConfig};

fn declared_server() -> ServerConfig {
    ServerConfig {
        id: Uuid::new_v4(),
        platform: Platform::Plex,
        name: "living-room".to_string(),
        base_url: "http://plex.local:32400".to_string(),
        source: ServerSource::Declared,
        enabled: true,
        webhook_enabled: true,
        realtime_enabled: false,
        polling_enabled: false,
        polling_interval_secs: 60,
    }
}

async fn test_state(declared: Vec<ServerConfig>) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("api.db")).await.unwrap();
    rules_db::ensure_default_rules(&pool).await.unwrap();

    let event_bus = EventBus::new(64);
    let registry = Registry::new(pool.clone(), declared, event_bus.clone());
    let wal = Arc::new(Wal::new(pool.clone(), WalConfig::default()));
    let resolver = Arc::new(Resolver::new(pool.clone(), 300, event_bus.clone()));
    let engine = Arc::new(DetectionEngine::new(pool.clone(), 50, event_bus.clone()));
    let sink = Arc::new(PipelineSink {
        resolver: Arc::clone(&resolver),
        engine: Arc::clone(&engine),
    });
    let orchestrator = Orchestrator::new(Arc::clone(&registry), Arc::clone(&wal), sink);

    let state = AppState {
        db: pool,
        registry,
        wal,
        resolver,
        engine,
        orchestrator,
        broadcaster: SseBroadcaster::new(event_bus.clone()),
        events: event_bus,
        port: 0,
    };
    (state, dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, _dir) = test_state(vec![]).await;
    let app = api::create_router(state);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "playguard-ingest");
}

#[tokio::test]
async fn test_server_crud_through_api() {
    let (state, _dir) = test_state(vec![]).await;
    let app = api::create_router(state);

    // Create an administered server.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/servers")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "platform": "jellyfin",
                        "name": "attic",
                        "base_url": "http://jellyfin.local:8096",
                        "polling_enabled": true,
                        "polling_interval_secs": 60
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    assert_eq!(created["source"], "administered");
    let id = created["id"].as_str().unwrap().to_string();

    // It shows up in the listing.
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/v1/servers").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // And individually.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/servers/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown id is a structured 404.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/servers/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_declared_server_mutation_returns_conflict() {
    let declared = declared_server();
    let declared_id = declared.id;
    let (state, _dir) = test_state(vec![declared]).await;
    let app = api::create_router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/servers")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "id": declared_id,
                        "platform": "plex",
                        "name": "renamed",
                        "base_url": "http://plex.local:32400"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "CONFLICT");

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/servers/{}", declared_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_webhook_ingestion_paths() {
    let declared = declared_server();
    let declared_id = declared.id;
    let (state, _dir) = test_state(vec![declared]).await;
    let app = api::create_router(state);

    // Valid payload is accepted once durably appended.
    let payload = json!({
        "sessionKey": "42",
        "Account": {"title": "alice"},
        "Player": {"publicAddress": "203.0.113.9", "product": "Plex Web"},
        "Metadata": {"title": "Blade Runner", "type": "movie"},
        "startedAt": "2026-03-01T20:00:00Z"
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/ingest/webhook/{}", declared_id))
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], true);
    assert!(body["wal_seq"].as_i64().unwrap() >= 1);

    // Malformed payload is rejected before the WAL.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/ingest/webhook/{}", declared_id))
                .header("content-type", "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown server is a 404.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/ingest/webhook/{}", Uuid::new_v4()))
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rule_update_through_api() {
    let (state, _dir) = test_state(vec![]).await;
    let app = api::create_router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/v1/rules/geo_restriction")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "enabled": true,
                        "config": { "blocked_countries": ["KP"], "allowed_countries": [] },
                        "severity": "critical"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["severity"], "critical");
    assert_eq!(body["config"]["blocked_countries"][0], "KP");

    // Unknown rule type is a 400.
    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/v1/rules/psychic_prediction")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "enabled": true, "config": {}, "severity": "info" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_read_endpoints_are_available() {
    let (state, _dir) = test_state(vec![]).await;
    let app = api::create_router(state);

    for uri in [
        "/api/v1/alerts",
        "/api/v1/audit",
        "/api/v1/audit/stats",
        "/api/v1/trust",
        "/api/v1/rules",
        "/api/v1/wal/stats",
        "/api/v1/detect/metrics",
        "/api/v1/servers/status",
    ] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "GET {} failed", uri);
    }
}
