//! Dedup resolver
//!
//! Consumes WAL-committed raw events, groups candidates that plausibly
//! describe the same physical playback, and keeps exactly one
//! canonical PlaybackEvent per group. Every discard decision lands in
//! the audit log where an administrator can later confirm or reverse
//! it.
//!
//! Grouping key: (user, media title, time overlap). Two events belong
//! to the same group when their intervals overlap or sit within a
//! small fixed gap. Within a group the dedup layer priority decides;
//! receipt timestamp breaks ties.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use playguard_common::events::{EventBus, PipelineEvent};
use playguard_common::time::{coincidence_ratio, intervals_overlap_or_near};
use playguard_common::types::{
    AuditStatus, DedupAuditEntry, DedupLayer, DedupReason, PlaybackEvent, RawEvent,
};
use playguard_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{audit as audit_db, events as events_db};
pub use crate::db::audit::{AuditFilter, AuditStats};

/// Outcome of resolving one committed raw event.
#[derive(Debug)]
pub enum Resolution {
    /// The event became (or replaced) the canonical event for its group
    Canonical(PlaybackEvent),
    /// The event was discarded in favor of an existing canonical event
    Duplicate { canonical_id: Uuid, audit_id: Uuid },
    /// Re-delivery of an event that is already canonical; no-op so
    /// at-least-once WAL delivery stays idempotent
    AlreadyResolved { canonical_id: Uuid },
}

pub struct Resolver {
    pool: SqlitePool,
    /// Gap allowance when matching intervals into a group
    gap: Duration,
    /// Per-user locks; a dedup group never spans users, so this gives
    /// serial, atomic group membership without a global lock.
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: EventBus,
}

impl Resolver {
    pub fn new(pool: SqlitePool, gap_seconds: i64, events: EventBus) -> Self {
        Self {
            pool,
            gap: Duration::seconds(gap_seconds.max(0)),
            user_locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn user_lock(&self, user: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.user_locks.lock().expect("user lock map poisoned");
        map.entry(user.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Resolve one committed raw event into the canonical stream.
    pub async fn resolve(&self, raw: RawEvent) -> Result<Resolution> {
        let lock = self.user_lock(&raw.user);
        let _guard = lock.lock().await;

        let candidates = self.group_candidates(&raw).await?;

        // Idempotency on re-delivery: the WAL guarantees at-least-once,
        // so an identical event may come around again after a crash
        // between handoff and commit-marking.
        if let Some(existing) = candidates.iter().find(|c| {
            c.raw.server_id == raw.server_id
                && c.raw.session_key == raw.session_key
                && c.raw.started_at == raw.started_at
        }) {
            debug!(event_id = %existing.id, "re-delivered event already canonical");
            return Ok(Resolution::AlreadyResolved { canonical_id: existing.id });
        }

        let incumbent = match self.select_incumbent(&candidates, &raw) {
            Some(incumbent) => incumbent,
            None => {
                let event = self.insert_canonical(raw, false).await?;
                return Ok(Resolution::Canonical(event));
            }
        };

        let new_layer = DedupLayer::derive(raw.platform, raw.ingest_mode);
        if new_layer.priority() < incumbent.dedup_layer.priority() {
            // Late-arriving higher-priority candidate: it takes over as
            // canonical and the incumbent is demoted into the audit log.
            let event = self.insert_canonical(raw, false).await?;
            let audit_id = self
                .record_discard(incumbent.raw.clone(), incumbent.dedup_layer, &event)
                .await?;
            events_db::delete_playback_event(&self.pool, incumbent.id).await?;
            info!(
                demoted = %incumbent.id,
                canonical = %event.id,
                audit = %audit_id,
                "canonical event replaced by higher-priority source"
            );
            Ok(Resolution::Canonical(event))
        } else {
            let canonical_id = incumbent.id;
            let audit_id = self.record_discard(raw, new_layer, incumbent).await?;
            Ok(Resolution::Duplicate { canonical_id, audit_id })
        }
    }

    /// Canonical events that fall into the same group as the raw event.
    async fn group_candidates(&self, raw: &RawEvent) -> Result<Vec<PlaybackEvent>> {
        // Generous start-time window; exact interval matching happens
        // below so the window only needs to contain every plausible
        // group member.
        let window_start = raw.started_at - Duration::hours(24);
        let window_end =
            raw.stopped_at.unwrap_or(raw.started_at) + self.gap + Duration::hours(24);

        let nearby = events_db::dedup_candidates(
            &self.pool,
            &raw.user,
            &raw.media_title,
            window_start,
            window_end,
        )
        .await?;

        Ok(nearby
            .into_iter()
            .filter(|c| {
                intervals_overlap_or_near(
                    c.raw.started_at,
                    c.raw.stopped_at,
                    raw.started_at,
                    raw.stopped_at,
                    self.gap,
                )
            })
            .collect())
    }

    /// The canonical event the new candidate competes against. The
    /// one-canonical-per-group invariant means at most one should
    /// exist; if several match (groups bridged by the new event's
    /// interval), the grouping is ambiguous and the priority order
    /// decides rather than failing the pipeline.
    fn select_incumbent<'a>(
        &self,
        candidates: &'a [PlaybackEvent],
        raw: &RawEvent,
    ) -> Option<&'a PlaybackEvent> {
        if candidates.len() > 1 {
            warn!(
                user = %raw.user,
                media = %raw.media_title,
                count = candidates.len(),
                "ambiguous dedup group, falling back to priority order"
            );
        }
        candidates.iter().min_by(|a, b| {
            a.dedup_layer
                .priority()
                .cmp(&b.dedup_layer.priority())
                .then(a.raw.received_at.cmp(&b.raw.received_at))
        })
    }

    async fn insert_canonical(&self, raw: RawEvent, restored: bool) -> Result<PlaybackEvent> {
        let layer = DedupLayer::derive(raw.platform, raw.ingest_mode);
        let event = PlaybackEvent {
            id: Uuid::new_v4(),
            raw,
            dedup_layer: layer,
            restored,
            created_at: Utc::now(),
        };
        events_db::insert_playback_event(&self.pool, &event).await?;

        self.events.emit_lossy(PipelineEvent::EventCommitted {
            event_id: event.id,
            user: event.raw.user.clone(),
            timestamp: Utc::now(),
        });

        Ok(event)
    }

    /// Write the audit entry for a losing candidate.
    async fn record_discard(
        &self,
        discarded: RawEvent,
        discarded_layer: DedupLayer,
        canonical: &PlaybackEvent,
    ) -> Result<Uuid> {
        let reason = discard_reason(&discarded, discarded_layer, canonical);
        let entry = DedupAuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            discarded,
            canonical_event_id: canonical.id,
            reason,
            dedup_layer: discarded_layer,
            status: AuditStatus::PendingReview,
            restored_event_id: None,
            resolved_by: None,
            resolved_at: None,
        };
        audit_db::insert_audit_entry(&self.pool, &entry).await?;

        self.events.emit_lossy(PipelineEvent::AuditEntryCreated {
            audit_id: entry.id,
            user: entry.discarded.user.clone(),
            reason,
            timestamp: entry.timestamp,
        });

        debug!(audit = %entry.id, reason = reason.as_str(), "candidate discarded");
        Ok(entry.id)
    }

    /// Administrator agreement with a discard decision. No data change
    /// beyond the status transition.
    pub async fn confirm(&self, audit_id: Uuid, resolved_by: &str) -> Result<()> {
        audit_db::mark_confirmed(&self.pool, audit_id, resolved_by).await
    }

    /// Administrator reversal: promote the discarded raw event to a new
    /// independent PlaybackEvent. The original canonical event is never
    /// touched.
    pub async fn restore(&self, audit_id: Uuid, resolved_by: &str) -> Result<PlaybackEvent> {
        let entry = audit_db::get_audit_entry(&self.pool, audit_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("audit entry {} not found", audit_id)))?;

        if entry.status != AuditStatus::PendingReview {
            return Err(Error::InvalidInput(format!(
                "audit entry {} already resolved as {}",
                audit_id,
                entry.status.as_str()
            )));
        }

        let lock = self.user_lock(&entry.discarded.user);
        let _guard = lock.lock().await;

        let event = self.insert_canonical(entry.discarded.clone(), true).await?;
        audit_db::mark_restored(&self.pool, audit_id, resolved_by, event.id).await?;

        info!(audit = %audit_id, restored_event = %event.id, "discarded event restored");
        Ok(event)
    }

    /// Resolver accuracy over a rolling window, for operator dashboards
    /// only.
    pub async fn audit_stats(&self, window_days: i64) -> Result<AuditStats> {
        let window_start = Utc::now() - Duration::days(window_days.max(1));
        audit_db::audit_stats(&self.pool, window_start).await
    }
}

/// Why a candidate lost to the canonical event.
fn discard_reason(
    discarded: &RawEvent,
    discarded_layer: DedupLayer,
    canonical: &PlaybackEvent,
) -> DedupReason {
    if discarded_layer.priority() != canonical.dedup_layer.priority() {
        return DedupReason::LowerPrioritySource;
    }

    match coincidence_ratio(
        discarded.started_at,
        discarded.stopped_at,
        canonical.raw.started_at,
        canonical.raw.stopped_at,
    ) {
        Some(ratio) if ratio >= 0.99 => DedupReason::ExactDuplicate,
        _ => DedupReason::OverlappingSession,
    }
}
