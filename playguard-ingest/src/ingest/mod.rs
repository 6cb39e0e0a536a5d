//! Ingestion orchestration
//!
//! Spawns one supervised worker per (server, enabled mode) pair and
//! one WAL commit worker per server. Workers exit on their own when a
//! server is disabled or deleted; the orchestrator tracks what is
//! running so re-enabling a server respawns its workers. Webhook
//! ingestion has no standing worker: payloads arrive through the HTTP
//! route and are normalized and appended here.

pub mod normalize;
pub mod poller;
pub mod realtime;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use playguard_common::types::{IngestMode, ServerConfig, ServerStatus};
use playguard_common::{Error, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::Registry;
use crate::wal::{self, CommitSink, Wal};

pub struct Orchestrator {
    registry: Arc<Registry>,
    wal: Arc<Wal>,
    sink: Arc<dyn CommitSink>,
    /// (server, mode) pairs with a live ingestion worker. Shared with
    /// the worker tasks so they deregister themselves on exit.
    active_workers: Arc<Mutex<HashSet<(Uuid, IngestMode)>>>,
    /// Servers with a live commit worker
    active_committers: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, wal: Arc<Wal>, sink: Arc<dyn CommitSink>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            wal,
            sink,
            active_workers: Arc::new(Mutex::new(HashSet::new())),
            active_committers: Mutex::new(HashSet::new()),
        })
    }

    /// Spawn workers for every enabled server, plus commit workers for
    /// any server that still has WAL entries from a previous run.
    pub async fn start_all(&self) -> Result<()> {
        let servers = self.registry.list_servers().await?;
        for server in &servers {
            self.ensure_workers(server);
        }

        // Servers deleted from config may still have entries draining.
        for server_id in crate::db::wal::pending_server_ids(self.wal.pool()).await? {
            self.ensure_commit_worker(server_id);
        }

        Ok(())
    }

    /// Make sure the right workers are running for a server's current
    /// configuration. Safe to call repeatedly; used at startup and
    /// after every admin upsert.
    pub fn ensure_workers(&self, server: &ServerConfig) {
        if !server.enabled {
            return;
        }

        self.ensure_commit_worker(server.id);

        if server.polling_enabled {
            self.spawn_ingest_worker(server.id, IngestMode::Poll);
        }
        if server.realtime_enabled {
            self.spawn_ingest_worker(server.id, IngestMode::Realtime);
        }
        if server.webhook_enabled {
            self.registry.set_status(server.id, ServerStatus::Configured, None);
        }
    }

    fn spawn_ingest_worker(&self, server_id: Uuid, mode: IngestMode) {
        {
            let mut active = self.active_workers.lock().expect("worker set poisoned");
            if !active.insert((server_id, mode)) {
                return;
            }
        }

        let active_workers = Arc::clone(&self.active_workers);
        let registry = Arc::clone(&self.registry);
        let wal = Arc::clone(&self.wal);
        tokio::spawn(async move {
            match mode {
                IngestMode::Poll => poller::run_poll_worker(server_id, registry, wal).await,
                IngestMode::Realtime => realtime::run_realtime_worker(server_id, registry, wal).await,
                IngestMode::Webhook => {}
            }
            active_workers
                .lock()
                .expect("worker set poisoned")
                .remove(&(server_id, mode));
        });

        info!(server_id = %server_id, mode = mode.as_str(), "ingestion worker spawned");
    }

    fn ensure_commit_worker(&self, server_id: Uuid) {
        {
            let mut active = self.active_committers.lock().expect("committer set poisoned");
            if !active.insert(server_id) {
                return;
            }
        }

        let wal = Arc::clone(&self.wal);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            wal::run_commit_worker(wal, server_id, sink).await;
        });
    }

    /// Webhook ingestion path: validate, normalize, and durably append
    /// one pushed payload. Returns the WAL sequence number; an append
    /// failure fails the whole request so the upstream retries.
    pub async fn ingest_webhook(&self, server_id: Uuid, body: &[u8]) -> Result<i64> {
        let server = self
            .registry
            .get_server(server_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("server {} not found", server_id)))?;

        if !server.enabled || !server.webhook_enabled {
            return Err(Error::InvalidInput(format!(
                "server {} does not accept webhook events",
                server_id
            )));
        }

        let event = match normalize::normalize(&server, IngestMode::Webhook, body) {
            Ok(event) => event,
            Err(e) => {
                // Malformed payloads are logged and dropped before the
                // WAL; the error propagates so the sender sees a 4xx.
                warn!(server_id = %server_id, error = %e, "rejecting malformed webhook payload");
                return Err(e);
            }
        };

        let seq = self.wal.append(&event).await?;
        self.registry.record_sync_ok(server_id);
        Ok(seq)
    }
}
