//! Canonical data model for the Playguard pipeline
//!
//! These types flow between the ingestion workers, the WAL, the dedup
//! resolver, the detection engine, and the HTTP API. Enum variants are
//! stored in SQLite as their snake_case string form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Upstream media-server platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Plex,
    Jellyfin,
    /// Aggregator that re-reports sessions observed on another server
    Tautulli,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Plex => "plex",
            Platform::Jellyfin => "jellyfin",
            Platform::Tautulli => "tautulli",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "plex" => Ok(Platform::Plex),
            "jellyfin" => Ok(Platform::Jellyfin),
            "tautulli" => Ok(Platform::Tautulli),
            other => Err(Error::InvalidInput(format!("unknown platform: {}", other))),
        }
    }
}

/// How an event reached the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Inbound push callback from the server
    Webhook,
    /// Persistent realtime channel (WebSocket)
    Realtime,
    /// Periodic polling
    Poll,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestMode::Webhook => "webhook",
            IngestMode::Realtime => "realtime",
            IngestMode::Poll => "poll",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "webhook" => Ok(IngestMode::Webhook),
            "realtime" => Ok(IngestMode::Realtime),
            "poll" => Ok(IngestMode::Poll),
            other => Err(Error::InvalidInput(format!("unknown ingest mode: {}", other))),
        }
    }
}

/// Source category of a candidate event, used to break ties among
/// duplicates. Lower priority value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupLayer {
    /// Realtime push from the authoritative server
    RealtimePush,
    /// Push callback from the authoritative server
    Webhook,
    /// Poll of the authoritative server
    DirectPoll,
    /// Poll of an aggregator re-reporting another server's sessions
    AggregatorPoll,
}

impl DedupLayer {
    /// Selection priority; lower outranks higher.
    pub fn priority(&self) -> u8 {
        match self {
            DedupLayer::RealtimePush => 0,
            DedupLayer::Webhook => 1,
            DedupLayer::DirectPoll => 2,
            DedupLayer::AggregatorPoll => 3,
        }
    }

    /// Derive the layer from the producing platform and ingestion mode.
    pub fn derive(platform: Platform, mode: IngestMode) -> Self {
        match (platform, mode) {
            (_, IngestMode::Realtime) => DedupLayer::RealtimePush,
            (_, IngestMode::Webhook) => DedupLayer::Webhook,
            (Platform::Tautulli, IngestMode::Poll) => DedupLayer::AggregatorPoll,
            (_, IngestMode::Poll) => DedupLayer::DirectPoll,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DedupLayer::RealtimePush => "realtime_push",
            DedupLayer::Webhook => "webhook",
            DedupLayer::DirectPoll => "direct_poll",
            DedupLayer::AggregatorPoll => "aggregator_poll",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "realtime_push" => Ok(DedupLayer::RealtimePush),
            "webhook" => Ok(DedupLayer::Webhook),
            "direct_poll" => Ok(DedupLayer::DirectPoll),
            "aggregator_poll" => Ok(DedupLayer::AggregatorPoll),
            other => Err(Error::InvalidInput(format!("unknown dedup layer: {}", other))),
        }
    }
}

/// Where a server configuration came from. Declared entries are loaded
/// from the config file at process start and cannot be edited or
/// deleted through the administrative interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerSource {
    Declared,
    Administered,
}

impl ServerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerSource::Declared => "declared",
            ServerSource::Administered => "administered",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "declared" => Ok(ServerSource::Declared),
            "administered" => Ok(ServerSource::Administered),
            other => Err(Error::InvalidInput(format!("unknown server source: {}", other))),
        }
    }
}

/// Connection/sync status of a registered server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Configured,
    Connecting,
    Connected,
    Syncing,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Configured => "configured",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Syncing => "syncing",
            ServerStatus::Error => "error",
        }
    }
}

/// A registered upstream media server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: Uuid,
    pub platform: Platform,
    pub name: String,
    /// Base URL of the upstream API, e.g. `http://plex.local:32400`
    pub base_url: String,
    pub source: ServerSource,
    pub enabled: bool,
    pub webhook_enabled: bool,
    pub realtime_enabled: bool,
    pub polling_enabled: bool,
    pub polling_interval_secs: u64,
}

/// Runtime health of a registered server, maintained by the ingestion
/// workers and read by the status API. Sync failures land here; they
/// never disable or delete the configuration itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealth {
    pub status: ServerStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self {
            status: ServerStatus::Configured,
            last_sync_at: None,
            last_sync_status: None,
            last_error: None,
            last_error_at: None,
        }
    }
}

/// A normalized playback report from one upstream source, before
/// deduplication. Immutable once created; owned by the WAL until
/// committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub server_id: Uuid,
    /// Platform of the producing server, carried so the dedup layer
    /// can be derived without a registry lookup
    pub platform: Platform,
    /// Platform-native session key
    pub session_key: String,
    pub user: String,
    pub media_title: String,
    pub media_type: String,
    pub started_at: DateTime<Utc>,
    /// None while the session is still open
    pub stopped_at: Option<DateTime<Utc>>,
    pub ip_address: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub device: Option<String>,
    pub player: Option<String>,
    pub ingest_mode: IngestMode,
    pub received_at: DateTime<Utc>,
}

/// Status of a WAL entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalStatus {
    Pending,
    Committed,
    Failed,
}

impl WalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalStatus::Pending => "pending",
            WalStatus::Committed => "committed",
            WalStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WalStatus::Pending),
            "committed" => Ok(WalStatus::Committed),
            "failed" => Ok(WalStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown WAL status: {}", other))),
        }
    }
}

/// One durable WAL entry wrapping a serialized RawEvent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: i64,
    pub server_id: Uuid,
    pub payload: String,
    pub status: WalStatus,
    pub attempt_count: i64,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WalEntry {
    /// Deserialize the wrapped RawEvent.
    pub fn raw_event(&self) -> Result<RawEvent> {
        serde_json::from_str(&self.payload)
            .map_err(|e| Error::WalCommit(format!("undecodable WAL payload seq {}: {}", self.seq, e)))
    }
}

/// The single canonical event selected to represent one physical
/// playback after deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub id: Uuid,
    #[serde(flatten)]
    pub raw: RawEvent,
    pub dedup_layer: DedupLayer,
    /// True only for events promoted by an administrator restore
    pub restored: bool,
    pub created_at: DateTime<Utc>,
}

/// Why a candidate lost deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupReason {
    /// Intervals are at least 99% coincident
    ExactDuplicate,
    /// Intervals overlap but are not near-coincident
    OverlappingSession,
    /// Selection was purely priority-driven across dedup layers
    LowerPrioritySource,
}

impl DedupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupReason::ExactDuplicate => "exact_duplicate",
            DedupReason::OverlappingSession => "overlapping_session",
            DedupReason::LowerPrioritySource => "lower_priority_source",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "exact_duplicate" => Ok(DedupReason::ExactDuplicate),
            "overlapping_session" => Ok(DedupReason::OverlappingSession),
            "lower_priority_source" => Ok(DedupReason::LowerPrioritySource),
            other => Err(Error::InvalidInput(format!("unknown dedup reason: {}", other))),
        }
    }
}

/// Review status of a dedup audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    PendingReview,
    UserConfirmed,
    UserRestored,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::PendingReview => "pending_review",
            AuditStatus::UserConfirmed => "user_confirmed",
            AuditStatus::UserRestored => "user_restored",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending_review" => Ok(AuditStatus::PendingReview),
            "user_confirmed" => Ok(AuditStatus::UserConfirmed),
            "user_restored" => Ok(AuditStatus::UserRestored),
            other => Err(Error::InvalidInput(format!("unknown audit status: {}", other))),
        }
    }
}

/// Permanent record of one discard decision by the dedup resolver.
/// Append-only; status transitions only through administrator
/// confirm/restore actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupAuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Snapshot of the discarded RawEvent
    pub discarded: RawEvent,
    pub canonical_event_id: Uuid,
    pub reason: DedupReason,
    pub dedup_layer: DedupLayer,
    pub status: AuditStatus,
    /// Set only when status is UserRestored
    pub restored_event_id: Option<Uuid>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Detection rule variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    ImpossibleTravel,
    ConcurrentStreams,
    DeviceVelocity,
    GeoRestriction,
    SimultaneousLocations,
}

impl RuleType {
    pub const ALL: [RuleType; 5] = [
        RuleType::ImpossibleTravel,
        RuleType::ConcurrentStreams,
        RuleType::DeviceVelocity,
        RuleType::GeoRestriction,
        RuleType::SimultaneousLocations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::ImpossibleTravel => "impossible_travel",
            RuleType::ConcurrentStreams => "concurrent_streams",
            RuleType::DeviceVelocity => "device_velocity",
            RuleType::GeoRestriction => "geo_restriction",
            RuleType::SimultaneousLocations => "simultaneous_locations",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "impossible_travel" => Ok(RuleType::ImpossibleTravel),
            "concurrent_streams" => Ok(RuleType::ConcurrentStreams),
            "device_velocity" => Ok(RuleType::DeviceVelocity),
            "geo_restriction" => Ok(RuleType::GeoRestriction),
            "simultaneous_locations" => Ok(RuleType::SimultaneousLocations),
            other => Err(Error::InvalidInput(format!("unknown rule type: {}", other))),
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Trust-score penalty applied per violation at this severity.
    pub fn trust_penalty(&self) -> i64 {
        match self {
            Severity::Info => 5,
            Severity::Warning => 10,
            Severity::Critical => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::InvalidInput(format!("unknown severity: {}", other))),
        }
    }
}

/// Persisted detection rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    pub rule_type: RuleType,
    pub enabled: bool,
    /// Rule-type-specific parameters
    pub config: serde_json::Value,
    pub severity: Severity,
    pub updated_at: DateTime<Utc>,
}

/// An alert emitted by the detection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_type: RuleType,
    pub severity: Severity,
    pub user: String,
    pub server_id: Option<Uuid>,
    /// Canonical events that triggered the alert
    pub event_ids: Vec<Uuid>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Per-user trust ledger entry. Score is bounded [0, 100]; restricted
/// is advisory state for external consumers, never an access block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTrust {
    pub user: String,
    pub score: i64,
    pub violation_count: i64,
    pub restricted: bool,
    pub last_violation_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserTrust {
    /// Fresh ledger entry for a user never seen before.
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            score: 100,
            violation_count: 0,
            restricted: false,
            last_violation_at: None,
            updated_at: Utc::now(),
        }
    }
}
