//! HTTP API for the Playguard pipeline
//!
//! Admin CRUD for servers and rules, audit confirm/restore, alert
//! acknowledgement, read-only dashboards endpoints, the inbound
//! webhook, and the SSE event stream. Read endpoints are side-effect
//! free and never hold a lock that ingestion depends on.

pub mod handlers;
pub mod sse;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check (no prefix)
        .route("/health", get(handlers::health_check))

        // Inbound push events
        .route("/ingest/webhook/:server_id", post(handlers::ingest_webhook))

        // API v1 routes
        .nest("/api/v1", Router::new()
            // Server registry
            .route("/servers", get(handlers::list_servers))
            .route("/servers", post(handlers::upsert_server))
            .route("/servers/test", post(handlers::test_connection))
            .route("/servers/status", get(handlers::server_statuses))
            .route("/servers/:id", get(handlers::get_server))
            .route("/servers/:id", delete(handlers::delete_server))

            // Detection rules
            .route("/rules", get(handlers::list_rules))
            .route("/rules/:rule_type", put(handlers::update_rule))

            // Dedup audit trail
            .route("/audit", get(handlers::list_audit_entries))
            .route("/audit/stats", get(handlers::audit_stats))
            .route("/audit/:id/confirm", post(handlers::confirm_audit_entry))
            .route("/audit/:id/restore", post(handlers::restore_audit_entry))

            // Alerts
            .route("/alerts", get(handlers::list_alerts))
            .route("/alerts/:id/ack", post(handlers::acknowledge_alert))

            // Trust ledger
            .route("/trust", get(handlers::list_trust))
            .route("/trust/:user", get(handlers::get_trust))

            // Operator visibility
            .route("/wal/stats", get(handlers::wal_stats))
            .route("/detect/metrics", get(handlers::detect_metrics))

            // SSE events
            .route("/events", get(handlers::sse_handler))
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - immutable config or undrained WAL
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<playguard_common::Error> for ApiError {
    fn from(err: playguard_common::Error) -> Self {
        use playguard_common::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) | Error::IngestionValidation(msg) => ApiError::BadRequest(msg),
            Error::ImmutableConfig(msg) | Error::PendingWalEntries(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
