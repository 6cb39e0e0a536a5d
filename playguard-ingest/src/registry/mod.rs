//! Server registry
//!
//! Holds the set of configured upstream media servers: declared
//! entries loaded from the config file (immutable for the process
//! lifetime) and administered entries persisted in the database and
//! managed through the admin API. The registry is the only mutation
//! path for configuration; ingestion workers update health state here
//! but can never disable or delete a server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use playguard_common::events::{EventBus, PipelineEvent};
use playguard_common::types::{ServerConfig, ServerHealth, ServerSource, ServerStatus};
use playguard_common::{Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::servers as servers_db;
use crate::db::wal as wal_db;

/// Result of a connection probe. Never persisted; never mutates status.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Combined configuration and health view for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusSummary {
    #[serde(flatten)]
    pub config: ServerConfig,
    #[serde(flatten)]
    pub health: ServerHealth,
}

pub struct Registry {
    pool: SqlitePool,
    declared: HashMap<Uuid, ServerConfig>,
    health: Mutex<HashMap<Uuid, ServerHealth>>,
    events: EventBus,
    http: reqwest::Client,
}

impl Registry {
    pub fn new(pool: SqlitePool, declared: Vec<ServerConfig>, events: EventBus) -> Arc<Self> {
        let declared_map: HashMap<Uuid, ServerConfig> =
            declared.into_iter().map(|s| (s.id, s)).collect();

        info!(declared = declared_map.len(), "server registry initialized");

        Arc::new(Self {
            pool,
            declared: declared_map,
            health: Mutex::new(HashMap::new()),
            events,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        })
    }

    /// All registered servers, declared first.
    pub async fn list_servers(&self) -> Result<Vec<ServerConfig>> {
        let mut servers: Vec<ServerConfig> = self.declared.values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers.extend(servers_db::list_servers(&self.pool).await?);
        Ok(servers)
    }

    pub async fn get_server(&self, id: Uuid) -> Result<Option<ServerConfig>> {
        if let Some(server) = self.declared.get(&id) {
            return Ok(Some(server.clone()));
        }
        servers_db::get_server(&self.pool, id).await
    }

    /// Create or update an administered server. Targeting a declared
    /// entry is rejected; the type of a declared entry can never be
    /// changed through this path.
    pub async fn upsert_administered(&self, mut config: ServerConfig) -> Result<ServerConfig> {
        if self.declared.contains_key(&config.id) {
            return Err(Error::ImmutableConfig(format!(
                "server {} is declared in configuration and cannot be modified",
                config.id
            )));
        }
        if config.base_url.is_empty() {
            return Err(Error::InvalidInput("base_url must not be empty".into()));
        }
        if config.polling_interval_secs == 0 {
            return Err(Error::InvalidInput("polling_interval_secs must be positive".into()));
        }

        config.source = ServerSource::Administered;
        servers_db::upsert_server(&self.pool, &config).await?;
        info!(server_id = %config.id, name = %config.name, "administered server upserted");
        Ok(config)
    }

    /// Delete an administered server. Rejected for declared entries,
    /// and rejected while WAL entries for the server are still pending
    /// commit; the caller retries after the WAL drains.
    pub async fn delete_administered(&self, id: Uuid) -> Result<()> {
        if self.declared.contains_key(&id) {
            return Err(Error::ImmutableConfig(format!(
                "server {} is declared in configuration and cannot be deleted",
                id
            )));
        }

        let pending = wal_db::pending_count_for_server(&self.pool, id).await?;
        if pending > 0 {
            return Err(Error::PendingWalEntries(format!(
                "server {} still has {} WAL entries pending commit",
                id, pending
            )));
        }

        if !servers_db::delete_server(&self.pool, id).await? {
            return Err(Error::NotFound(format!("server {} not found", id)));
        }

        self.health.lock().expect("health lock poisoned").remove(&id);
        info!(server_id = %id, "administered server deleted");
        Ok(())
    }

    /// Probe a candidate configuration for reachability and latency.
    /// Persists nothing and touches no status.
    pub async fn test_connection(&self, config: &ServerConfig) -> ConnectionTest {
        let url = format!(
            "{}{}",
            config.base_url.trim_end_matches('/'),
            probe_path(config)
        );
        let start = Instant::now();

        match self.http.get(&url).send().await {
            Ok(response) => {
                let latency = start.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    ConnectionTest {
                        reachable: true,
                        latency_ms: Some(latency),
                        error: None,
                    }
                } else {
                    ConnectionTest {
                        reachable: false,
                        latency_ms: Some(latency),
                        error: Some(format!("upstream returned {}", response.status())),
                    }
                }
            }
            Err(e) => ConnectionTest {
                reachable: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Update a server's runtime status. Called by ingestion workers;
    /// a failed sync records the error but never disables the server.
    pub fn set_status(&self, server_id: Uuid, status: ServerStatus, error: Option<String>) {
        let now = Utc::now();
        {
            let mut health = self.health.lock().expect("health lock poisoned");
            let entry = health.entry(server_id).or_default();
            entry.status = status;
            if let Some(ref message) = error {
                entry.last_error = Some(message.clone());
                entry.last_error_at = Some(now);
            }
        }

        if error.is_some() {
            warn!(server_id = %server_id, status = status.as_str(), "server status changed");
        }

        self.events.emit_lossy(PipelineEvent::ServerStatusChanged {
            server_id,
            status,
            error,
            timestamp: now,
        });
    }

    /// Record a successful sync cycle.
    pub fn record_sync_ok(&self, server_id: Uuid) {
        let mut health = self.health.lock().expect("health lock poisoned");
        let entry = health.entry(server_id).or_default();
        entry.status = ServerStatus::Connected;
        entry.last_sync_at = Some(Utc::now());
        entry.last_sync_status = Some("ok".into());
    }

    pub fn health_of(&self, server_id: Uuid) -> ServerHealth {
        self.health
            .lock()
            .expect("health lock poisoned")
            .get(&server_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Status summaries for every registered server.
    pub async fn server_statuses(&self) -> Result<Vec<ServerStatusSummary>> {
        let servers = self.list_servers().await?;
        Ok(servers
            .into_iter()
            .map(|config| {
                let health = self.health_of(config.id);
                ServerStatusSummary { config, health }
            })
            .collect())
    }
}

/// Cheap unauthenticated health path per platform.
fn probe_path(config: &ServerConfig) -> &'static str {
    match config.platform {
        playguard_common::types::Platform::Plex => "/identity",
        playguard_common::types::Platform::Jellyfin => "/System/Info/Public",
        playguard_common::types::Platform::Tautulli => "/status",
    }
}
