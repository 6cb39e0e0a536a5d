//! Write-ahead log
//!
//! Raw events are appended here before anything else happens to them;
//! an event is considered ingested only once `append` has returned.
//! Per-server commit workers drain pending entries in strict sequence
//! order and hand them to the dedup resolver. Failed handoffs are
//! retried with backoff up to a cap, then surfaced as a persistent
//! `failed` status. Nothing is ever silently discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use playguard_common::types::{RawEvent, WalEntry};
use playguard_common::{Error, Result};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::wal as wal_db;
pub use crate::db::wal::WalStats;

/// Downstream consumer of committed entries (the dedup resolver).
///
/// A returned error keeps the entry pending; it will be retried.
pub trait CommitSink: Send + Sync {
    fn deliver<'a>(&'a self, entry: WalEntry) -> BoxFuture<'a, Result<()>>;
}

/// WAL tuning knobs, loaded from settings at startup.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Commit attempts before an entry is marked failed
    pub max_attempts: i64,
    /// Entries pulled per commit pass
    pub batch_size: i64,
    /// Base delay between failed passes; doubles per attempt, capped
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            batch_size: 64,
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(30),
        }
    }
}

/// Append-side WAL handle, shared by all ingestion workers. Append is
/// safe under concurrent callers; sequence numbers are globally unique
/// and strictly increasing.
pub struct Wal {
    pool: SqlitePool,
    config: WalConfig,
    notifiers: Mutex<HashMap<Uuid, Arc<Notify>>>,
}

impl Wal {
    pub fn new(pool: SqlitePool, config: WalConfig) -> Self {
        Self {
            pool,
            config,
            notifiers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Durably append a raw event. Returns the assigned sequence
    /// number. On error the ingestion attempt has failed and the
    /// caller must retry the whole ingestion; the event was not
    /// accepted.
    pub async fn append(&self, event: &RawEvent) -> Result<i64> {
        let payload = serde_json::to_string(event)
            .map_err(|e| Error::WalAppend(format!("serialize event: {}", e)))?;

        let seq = wal_db::append(&self.pool, event.server_id, &payload).await?;
        debug!(seq, server_id = %event.server_id, "WAL append");

        self.notifier(event.server_id).notify_one();
        Ok(seq)
    }

    /// Per-server wakeup handle shared between append and the commit
    /// worker for that server.
    pub fn notifier(&self, server_id: Uuid) -> Arc<Notify> {
        let mut map = self.notifiers.lock().expect("notifier lock poisoned");
        map.entry(server_id).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    pub async fn stats(&self) -> Result<WalStats> {
        wal_db::stats(&self.pool).await
    }

    /// True while any entry for the server is still pending commit.
    pub async fn has_pending(&self, server_id: Uuid) -> Result<bool> {
        Ok(wal_db::pending_count_for_server(&self.pool, server_id).await? > 0)
    }

    /// Retention sweep for committed and permanently-failed entries.
    pub async fn purge_older_than_days(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days.max(1));
        wal_db::purge_before(&self.pool, cutoff).await
    }

    /// Replay every non-committed entry through the sink before new
    /// ingestion is accepted. Guarantees at-least-once delivery into
    /// the resolver across restarts. Entries that keep failing are
    /// marked failed once the attempt cap is reached, so replay always
    /// terminates.
    pub async fn replay_pending(&self, sink: &dyn CommitSink) -> Result<()> {
        let servers = wal_db::pending_server_ids(&self.pool).await?;
        if servers.is_empty() {
            info!("WAL replay: nothing pending");
            return Ok(());
        }

        info!(servers = servers.len(), "WAL replay: draining pending entries");
        for server_id in servers {
            loop {
                let outcome = commit_pass(&self.pool, server_id, sink, &self.config).await?;
                if outcome.remaining == 0 {
                    break;
                }
                if outcome.committed == 0 && outcome.failed == 0 {
                    // Every remaining entry errored below the cap; back
                    // off before the next pass.
                    tokio::time::sleep(self.config.retry_base).await;
                }
            }
        }

        info!("WAL replay complete");
        Ok(())
    }
}

/// Result of one commit pass over a server's pending entries.
#[derive(Debug, Default)]
pub struct CommitPassOutcome {
    pub committed: u64,
    pub failed: u64,
    /// Entries still pending after the pass
    pub remaining: i64,
}

/// Pull the oldest pending entries for one server in sequence order
/// and hand each to the sink. Stops at the first transient failure to
/// preserve per-server ordering; permanently failed entries no longer
/// block their successors.
pub async fn commit_pass(
    pool: &SqlitePool,
    server_id: Uuid,
    sink: &dyn CommitSink,
    config: &WalConfig,
) -> Result<CommitPassOutcome> {
    let batch = wal_db::pending_for_server(pool, server_id, config.batch_size).await?;
    let mut outcome = CommitPassOutcome::default();

    for entry in batch {
        let seq = entry.seq;
        match sink.deliver(entry).await {
            Ok(()) => {
                wal_db::mark_committed(pool, seq).await?;
                outcome.committed += 1;
            }
            Err(e) => {
                let attempts = wal_db::record_failed_attempt(pool, seq, &e.to_string()).await?;
                if attempts >= config.max_attempts {
                    error!(
                        seq,
                        server_id = %server_id,
                        attempts,
                        error = %e,
                        "WAL entry exceeded retry cap, marking failed"
                    );
                    wal_db::mark_failed(pool, seq, &e.to_string()).await?;
                    outcome.failed += 1;
                    // A permanently failed entry no longer gates the
                    // sequence; continue with the next one.
                    continue;
                }
                warn!(seq, server_id = %server_id, attempts, error = %e, "WAL commit attempt failed");
                // Transient failure: stop the pass so the entry is
                // retried in order.
                break;
            }
        }
    }

    outcome.remaining = wal_db::pending_count_for_server(pool, server_id).await?;
    Ok(outcome)
}

/// Long-running commit worker for one server. Exactly one of these
/// runs per server; entries for different servers commit concurrently
/// through their own workers.
pub async fn run_commit_worker(wal: Arc<Wal>, server_id: Uuid, sink: Arc<dyn CommitSink>) {
    let notify = wal.notifier(server_id);
    let config = wal.config().clone();
    let mut backoff = config.retry_base;

    info!(server_id = %server_id, "WAL commit worker started");

    loop {
        let outcome = match commit_pass(wal.pool(), server_id, sink.as_ref(), &config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(server_id = %server_id, error = %e, "commit pass error");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.retry_cap);
                continue;
            }
        };

        if outcome.remaining == 0 {
            backoff = config.retry_base;
            // Wait for the next append; wake periodically to be safe
            // against missed notifications.
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        } else if outcome.committed == 0 && outcome.failed == 0 {
            // Head entry is failing transiently; back off before retry.
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.retry_cap);
        } else {
            backoff = config.retry_base;
        }
    }
}
