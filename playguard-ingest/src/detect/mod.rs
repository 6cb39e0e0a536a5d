//! Detection engine
//!
//! Consumes the canonical event stream and evaluates every enabled
//! rule against each event plus a bounded recent-history window for
//! that user. Firing rules emit alerts and apply severity-weighted
//! penalties to the user's trust score.
//!
//! Ordering: all evaluation and trust mutation for one event completes
//! before the next event for the same user is evaluated. This is
//! enforced by routing each user's events through a dedicated queue
//! worker keyed by user identity; independent users run fully in
//! parallel.

pub mod rules;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use playguard_common::events::{EventBus, PipelineEvent};
use playguard_common::types::{Alert, DetectionRule, PlaybackEvent, RuleType};
use playguard_common::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{alerts as alerts_db, events as events_db, rules as rules_db, trust as trust_db};
use rules::{
    check_concurrent_streams, check_device_velocity, check_geo_restriction,
    check_impossible_travel, check_simultaneous_locations, overlaps_current,
    ConcurrentStreamsConfig, DeviceVelocityConfig, GeoRestrictionConfig, ImpossibleTravelConfig,
    RuleHit, SimultaneousLocationsConfig,
};

/// Per-rule evaluation counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleMetrics {
    pub checked: u64,
    pub fired: u64,
    pub errors: u64,
}

/// Engine-wide counters for operator visibility
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    pub events_processed: u64,
    pub alerts_generated: u64,
    pub detection_errors: u64,
    pub per_rule: HashMap<String, RuleMetrics>,
}

struct Job {
    event: PlaybackEvent,
    done: oneshot::Sender<Result<Vec<Alert>>>,
}

pub struct DetectionEngine {
    core: Arc<EngineCore>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

/// Shared evaluation state, cloned into every per-user worker task.
struct EngineCore {
    pool: SqlitePool,
    events: EventBus,
    /// Score below which the restricted flag is set (advisory only)
    restricted_threshold: i64,
    metrics: Mutex<EngineMetrics>,
}

impl DetectionEngine {
    pub fn new(pool: SqlitePool, restricted_threshold: i64, events: EventBus) -> Self {
        Self {
            core: Arc::new(EngineCore {
                pool,
                events,
                restricted_threshold,
                metrics: Mutex::new(EngineMetrics::default()),
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a canonical event for evaluation. Returns once all rules
    /// have run and the trust score is updated; submissions for the
    /// same user are serialized, different users evaluate in parallel.
    pub async fn submit(&self, event: PlaybackEvent) -> Result<Vec<Alert>> {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job { event, done: done_tx };

        let tx = self.worker_for(&job.event.raw.user);
        if tx.send(job).is_err() {
            return Err(Error::Internal("detection worker unavailable".into()));
        }

        done_rx
            .await
            .map_err(|_| Error::Internal("detection worker dropped job".into()))?
    }

    /// Sender for the user's queue worker, spawning it on first use.
    fn worker_for(&self, user: &str) -> mpsc::UnboundedSender<Job> {
        let mut workers = self.workers.lock().expect("worker map poisoned");
        if let Some(tx) = workers.get(user) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let core = Arc::clone(&self.core);
        let worker_user = user.to_string();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = core.evaluate(&job.event).await;
                let _ = job.done.send(result);
            }
            info!(user = %worker_user, "detection worker stopped");
        });

        workers.insert(user.to_string(), tx.clone());
        tx
    }

    /// Evaluate one event directly, without going through a per-user
    /// worker. The caller owns the ordering guarantee.
    pub async fn evaluate(&self, event: &PlaybackEvent) -> Result<Vec<Alert>> {
        self.core.evaluate(event).await
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.core.metrics.lock().expect("metrics lock poisoned").clone()
    }
}

impl EngineCore {
    /// Evaluate every enabled rule for one event, then apply trust
    /// penalties for any that fired. A rule failure is isolated: it is
    /// counted in the metrics and the remaining rules still run.
    async fn evaluate(&self, event: &PlaybackEvent) -> Result<Vec<Alert>> {
        let rules = rules_db::list_rules(&self.pool).await?;
        let mut alerts = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            self.note_checked(rule.rule_type);

            match self.run_rule(rule, event).await {
                Ok(Some(hit)) => {
                    let alert = self.raise_alert(rule, event, hit).await?;
                    alerts.push(alert);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        rule = rule.rule_type.as_str(),
                        error = %e,
                        "rule evaluation failed, other rules continue"
                    );
                    self.note_error(rule.rule_type);
                }
            }
        }

        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            metrics.events_processed += 1;
            metrics.alerts_generated += alerts.len() as u64;
        }

        Ok(alerts)
    }

    /// Run one rule against the event and its history window.
    async fn run_rule(&self, rule: &DetectionRule, event: &PlaybackEvent) -> Result<Option<RuleHit>> {
        match rule.rule_type {
            RuleType::ImpossibleTravel => {
                let config: ImpossibleTravelConfig = parse_config(&rule.config)?;
                let previous = events_db::last_event_for_user(
                    &self.pool,
                    &event.raw.user,
                    event.raw.started_at,
                    event.id,
                )
                .await?;
                Ok(previous.and_then(|prev| check_impossible_travel(&config, &prev, event)))
            }
            RuleType::ConcurrentStreams => {
                let config: ConcurrentStreamsConfig = parse_config(&rule.config)?;
                let history = self.history_window(event, Duration::hours(24)).await?;
                let overlapping: Vec<_> = history
                    .into_iter()
                    .filter(|other| overlaps_current(other, event))
                    .collect();
                Ok(check_concurrent_streams(&config, &overlapping, event))
            }
            RuleType::DeviceVelocity => {
                let config: DeviceVelocityConfig = parse_config(&rule.config)?;
                let since = event.raw.started_at - Duration::minutes(config.window_minutes.max(0));
                let ips = events_db::distinct_ips_since(&self.pool, &event.raw.user, since).await?;
                Ok(check_device_velocity(&config, &ips, event))
            }
            RuleType::GeoRestriction => {
                let config: GeoRestrictionConfig = parse_config(&rule.config)?;
                Ok(check_geo_restriction(&config, event))
            }
            RuleType::SimultaneousLocations => {
                let config: SimultaneousLocationsConfig = parse_config(&rule.config)?;
                let window = Duration::minutes(config.window_minutes.max(0));
                let recent = events_db::events_for_user_between(
                    &self.pool,
                    &event.raw.user,
                    event.raw.started_at - window,
                    event.raw.started_at + window,
                )
                .await?
                .into_iter()
                .filter(|other| other.id != event.id)
                .collect::<Vec<_>>();
                Ok(check_simultaneous_locations(&config, &recent, event))
            }
        }
    }

    /// Events for the user in a trailing window ending at this event.
    async fn history_window(
        &self,
        event: &PlaybackEvent,
        span: Duration,
    ) -> Result<Vec<PlaybackEvent>> {
        events_db::events_for_user_between(
            &self.pool,
            &event.raw.user,
            event.raw.started_at - span,
            event.raw.started_at,
        )
        .await
    }

    /// Persist the alert, apply the trust penalty, and broadcast both.
    async fn raise_alert(
        &self,
        rule: &DetectionRule,
        event: &PlaybackEvent,
        hit: RuleHit,
    ) -> Result<Alert> {
        let alert = Alert {
            id: Uuid::new_v4(),
            rule_type: rule.rule_type,
            severity: rule.severity,
            user: event.raw.user.clone(),
            server_id: Some(event.raw.server_id),
            event_ids: hit.event_ids,
            message: hit.message,
            metadata: hit.metadata,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            created_at: Utc::now(),
        };

        alerts_db::insert_alert(&self.pool, &alert).await?;
        self.note_fired(rule.rule_type);

        let trust = trust_db::apply_penalty(
            &self.pool,
            &event.raw.user,
            rule.severity.trust_penalty(),
            self.restricted_threshold,
        )
        .await?;

        info!(
            rule = rule.rule_type.as_str(),
            severity = rule.severity.as_str(),
            user = %alert.user,
            score = trust.score,
            "detection alert raised"
        );

        self.events.emit_lossy(PipelineEvent::AlertCreated { alert: alert.clone() });
        self.events.emit_lossy(PipelineEvent::TrustUpdated {
            user: trust.user,
            score: trust.score,
            restricted: trust.restricted,
            timestamp: trust.updated_at,
        });

        Ok(alert)
    }

    fn note_checked(&self, rule_type: RuleType) {
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics.per_rule.entry(rule_type.as_str().to_string()).or_default().checked += 1;
    }

    fn note_fired(&self, rule_type: RuleType) {
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics.per_rule.entry(rule_type.as_str().to_string()).or_default().fired += 1;
    }

    fn note_error(&self, rule_type: RuleType) {
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics.per_rule.entry(rule_type.as_str().to_string()).or_default().errors += 1;
        metrics.detection_errors += 1;
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::RuleEvaluation(format!("bad rule config: {}", e)))
}

/// Trust-score recovery scheduler: once per interval, raise every
/// score below 100 by `amount` and clear restricted flags that climb
/// back over the threshold.
pub async fn run_trust_recovery(
    pool: SqlitePool,
    amount: i64,
    interval: StdDuration,
    restricted_threshold: i64,
) {
    info!(amount, ?interval, "trust score recovery scheduler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; recover once at startup, then
    // on the interval.
    loop {
        ticker.tick().await;
        match trust_db::recover_scores(&pool, amount, restricted_threshold).await {
            Ok(touched) if touched > 0 => info!(touched, "trust score recovery completed"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "trust score recovery failed"),
        }
    }
}
