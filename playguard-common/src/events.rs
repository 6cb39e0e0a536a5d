//! Event types and EventBus for the Playguard pipeline
//!
//! Events are broadcast on a `tokio::sync::broadcast` channel and can
//! be serialized for SSE transmission to the dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{Alert, DedupReason, ServerStatus};

/// Pipeline event types
///
/// Every variant is safe to drop on the floor: broadcast consumers are
/// read-only and never hold a lock that ingestion depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A detection rule fired and an alert was persisted
    AlertCreated {
        alert: Alert,
    },

    /// A registered server's connection/sync status changed
    ServerStatusChanged {
        server_id: Uuid,
        status: ServerStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A user's trust score changed
    TrustUpdated {
        user: String,
        score: i64,
        restricted: bool,
        timestamp: DateTime<Utc>,
    },

    /// The dedup resolver discarded a candidate event
    AuditEntryCreated {
        audit_id: Uuid,
        user: String,
        reason: DedupReason,
        timestamp: DateTime<Utc>,
    },

    /// A canonical event was committed to storage
    EventCommitted {
        event_id: Uuid,
        user: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// SSE event name for this variant.
    pub fn event_name(&self) -> &'static str {
        match self {
            PipelineEvent::AlertCreated { .. } => "alert_created",
            PipelineEvent::ServerStatusChanged { .. } => "server_status_changed",
            PipelineEvent::TrustUpdated { .. } => "trust_updated",
            PipelineEvent::AuditEntryCreated { .. } => "audit_entry_created",
            PipelineEvent::EventCommitted { .. } => "event_committed",
        }
    }
}

/// Central event distribution bus for pipeline events
///
/// Uses tokio::broadcast internally: non-blocking publish, multiple
/// concurrent subscribers, automatic cleanup when subscribers drop,
/// lagged-message detection for slow consumers. Slow consumers never
/// block the producers in the pipeline.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Emit an event, ignoring whether anyone is listening. Pipeline
    /// events are advisory for dashboards; the durable record lives in
    /// the database.
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}
