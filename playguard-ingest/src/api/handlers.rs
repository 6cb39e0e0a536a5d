//! Request handlers for the Playguard API

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::sse::Sse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use playguard_common::types::{
    AuditStatus, DetectionRule, Platform, RuleType, ServerConfig, ServerSource, Severity,
    UserTrust,
};

use crate::api::{ApiError, ApiResult};
use crate::db::{alerts as alerts_db, rules as rules_db, trust as trust_db};
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "module": "playguard-ingest",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.port,
    }))
}

// ---------------------------------------------------------------------------
// Inbound webhook
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: bool,
    pub wal_seq: i64,
}

/// POST /ingest/webhook/:server_id
///
/// Accepts one platform-native session payload. The request only
/// succeeds once the event is durably in the WAL; senders should
/// retry on failure.
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(server_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<IngestResponse>> {
    let seq = state.orchestrator.ingest_webhook(server_id, &body).await?;
    Ok(Json(IngestResponse { accepted: true, wal_seq: seq }))
}

// ---------------------------------------------------------------------------
// Server registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UpsertServerRequest {
    /// Omit to create a new server
    pub id: Option<Uuid>,
    pub platform: String,
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub realtime_enabled: bool,
    #[serde(default)]
    pub polling_enabled: bool,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_polling_interval() -> u64 {
    60
}

impl UpsertServerRequest {
    fn into_config(self) -> ApiResult<ServerConfig> {
        let platform = Platform::parse(&self.platform).map_err(ApiError::from)?;
        Ok(ServerConfig {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            platform,
            name: self.name,
            base_url: self.base_url,
            source: ServerSource::Administered,
            enabled: self.enabled,
            webhook_enabled: self.webhook_enabled,
            realtime_enabled: self.realtime_enabled,
            polling_enabled: self.polling_enabled,
            polling_interval_secs: self.polling_interval_secs,
        })
    }
}

/// GET /api/v1/servers
pub async fn list_servers(State(state): State<AppState>) -> ApiResult<Json<Vec<ServerConfig>>> {
    Ok(Json(state.registry.list_servers().await?))
}

/// GET /api/v1/servers/:id
pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ServerConfig>> {
    state
        .registry
        .get_server(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("server {} not found", id)))
}

/// POST /api/v1/servers
pub async fn upsert_server(
    State(state): State<AppState>,
    Json(payload): Json<UpsertServerRequest>,
) -> ApiResult<Json<ServerConfig>> {
    let config = payload.into_config()?;
    let config = state.registry.upsert_administered(config).await?;
    state.orchestrator.ensure_workers(&config);
    Ok(Json(config))
}

/// DELETE /api/v1/servers/:id
pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.registry.delete_administered(id).await?;
    Ok(Json(json!({ "deleted": true })))
}

/// POST /api/v1/servers/test
///
/// Probes a candidate configuration without persisting anything.
pub async fn test_connection(
    State(state): State<AppState>,
    Json(payload): Json<UpsertServerRequest>,
) -> ApiResult<Json<crate::registry::ConnectionTest>> {
    let config = payload.into_config()?;
    Ok(Json(state.registry.test_connection(&config).await))
}

/// GET /api/v1/servers/status
pub async fn server_statuses(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<crate::registry::ServerStatusSummary>>> {
    Ok(Json(state.registry.server_statuses().await?))
}

// ---------------------------------------------------------------------------
// Detection rules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub enabled: bool,
    pub config: Value,
    pub severity: String,
}

/// GET /api/v1/rules
pub async fn list_rules(State(state): State<AppState>) -> ApiResult<Json<Vec<DetectionRule>>> {
    Ok(Json(rules_db::list_rules(&state.db).await?))
}

/// PUT /api/v1/rules/:rule_type
///
/// Takes effect for the next evaluated event; historical events are
/// never re-evaluated.
pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_type): Path<String>,
    Json(payload): Json<UpdateRuleRequest>,
) -> ApiResult<Json<DetectionRule>> {
    let rule_type = RuleType::parse(&rule_type).map_err(ApiError::from)?;
    let severity = Severity::parse(&payload.severity).map_err(ApiError::from)?;

    let rule = DetectionRule {
        rule_type,
        enabled: payload.enabled,
        config: payload.config,
        severity,
        updated_at: chrono::Utc::now(),
    };
    rules_db::update_rule(&state.db, &rule).await?;

    rules_db::get_rule(&state.db, rule_type)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("rule {} not found", rule_type.as_str())))
}

// ---------------------------------------------------------------------------
// Dedup audit trail
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub status: Option<String>,
    pub user: Option<String>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResolveRequest {
    #[serde(default)]
    pub resolved_by: Option<String>,
}

/// GET /api/v1/audit
pub async fn list_audit_entries(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<PagedResponse<playguard_common::types::DedupAuditEntry>>> {
    let status = query
        .status
        .as_deref()
        .map(AuditStatus::parse)
        .transpose()
        .map_err(ApiError::from)?;

    let filter = crate::dedup::AuditFilter {
        status,
        user: query.user,
        limit: query.limit,
        offset: query.offset,
    };
    let (items, total) = crate::db::audit::list_audit_entries(&state.db, &filter).await?;
    Ok(Json(PagedResponse { items, total }))
}

/// GET /api/v1/audit/stats
pub async fn audit_stats(
    State(state): State<AppState>,
) -> ApiResult<Json<crate::dedup::AuditStats>> {
    Ok(Json(state.resolver.audit_stats(30).await?))
}

/// POST /api/v1/audit/:id/confirm
pub async fn confirm_audit_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<ResolveRequest>>,
) -> ApiResult<Json<Value>> {
    let resolved_by = resolver_name(payload);
    state.resolver.confirm(id, &resolved_by).await?;
    Ok(Json(json!({ "status": "user_confirmed" })))
}

/// POST /api/v1/audit/:id/restore
pub async fn restore_audit_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<ResolveRequest>>,
) -> ApiResult<Json<Value>> {
    let resolved_by = resolver_name(payload);
    let event = state.resolver.restore(id, &resolved_by).await?;
    Ok(Json(json!({
        "status": "user_restored",
        "restored_event_id": event.id,
    })))
}

fn resolver_name(payload: Option<Json<ResolveRequest>>) -> String {
    payload
        .and_then(|Json(p)| p.resolved_by)
        .unwrap_or_else(|| "admin".to_string())
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub user: Option<String>,
    pub severity: Option<String>,
    pub acknowledged: Option<bool>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize, Default)]
pub struct AcknowledgeRequest {
    #[serde(default)]
    pub acknowledged_by: Option<String>,
}

/// GET /api/v1/alerts
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Json<PagedResponse<playguard_common::types::Alert>>> {
    let severity = query
        .severity
        .as_deref()
        .map(Severity::parse)
        .transpose()
        .map_err(ApiError::from)?;

    let filter = alerts_db::AlertFilter {
        user: query.user,
        severity,
        acknowledged: query.acknowledged,
        limit: query.limit,
        offset: query.offset,
    };
    let (items, total) = alerts_db::list_alerts(&state.db, &filter).await?;
    Ok(Json(PagedResponse { items, total }))
}

/// POST /api/v1/alerts/:id/ack
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<AcknowledgeRequest>>,
) -> ApiResult<Json<Value>> {
    let by = payload
        .and_then(|Json(p)| p.acknowledged_by)
        .unwrap_or_else(|| "admin".to_string());
    alerts_db::acknowledge_alert(&state.db, id, &by).await?;
    Ok(Json(json!({ "acknowledged": true })))
}

// ---------------------------------------------------------------------------
// Trust ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TrustQuery {
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// GET /api/v1/trust
pub async fn list_trust(
    State(state): State<AppState>,
    Query(query): Query<TrustQuery>,
) -> ApiResult<Json<Vec<UserTrust>>> {
    Ok(Json(trust_db::list_trust(&state.db, query.limit, query.offset).await?))
}

/// GET /api/v1/trust/:user
pub async fn get_trust(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> ApiResult<Json<UserTrust>> {
    trust_db::get_trust(&state.db, &user)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no trust record for {}", user)))
}

// ---------------------------------------------------------------------------
// Operator visibility
// ---------------------------------------------------------------------------

/// GET /api/v1/wal/stats
pub async fn wal_stats(State(state): State<AppState>) -> ApiResult<Json<crate::wal::WalStats>> {
    Ok(Json(state.wal.stats().await?))
}

/// GET /api/v1/detect/metrics
pub async fn detect_metrics(
    State(state): State<AppState>,
) -> ApiResult<Json<crate::detect::EngineMetrics>> {
    Ok(Json(state.engine.metrics()))
}

/// GET /api/v1/events
pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>> {
    state.broadcaster.handle_sse_connection()
}
