//! Polling ingestion worker
//!
//! One worker per server with polling enabled. Runs on a fixed
//! interval; a cycle that would overlap a still-running one is skipped
//! rather than queued. Each cycle fetches sessions since the last
//! cursor, normalizes them, and appends them to the WAL. The cursor
//! only advances once every append has succeeded, so an append failure
//! retries the whole cycle's ingestion on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use playguard_common::types::{Platform, ServerConfig, ServerStatus};
use playguard_common::{Error, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ingest::normalize;
use crate::registry::Registry;
use crate::wal::Wal;

/// Platform-specific session listing path.
fn sessions_path(platform: Platform) -> &'static str {
    match platform {
        Platform::Plex => "/status/sessions",
        Platform::Jellyfin => "/Sessions",
        Platform::Tautulli => "/api/v2/activity",
    }
}

/// Long-running poll loop for one server. Exits when the server is
/// deleted, disabled, or polling is turned off.
pub async fn run_poll_worker(server_id: Uuid, registry: Arc<Registry>, wal: Arc<Wal>) {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default();

    let mut cursor: Option<DateTime<Utc>> = None;
    let mut interval_secs = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_secs(60));

    info!(server_id = %server_id, "poll worker started");

    loop {
        // Re-read config each cycle so interval changes and disables
        // take effect without a restart.
        let server = match registry.get_server(server_id).await {
            Ok(Some(server)) if server.enabled && server.polling_enabled => server,
            Ok(_) => {
                info!(server_id = %server_id, "poll worker stopping: server disabled or removed");
                return;
            }
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "poll worker config read failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        if server.polling_interval_secs != interval_secs {
            interval_secs = server.polling_interval_secs;
            ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            // Skipped ticks are dropped, never queued: a poll cycle
            // that outlives its interval suppresses the next one.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }

        ticker.tick().await;

        registry.set_status(server_id, ServerStatus::Syncing, None);
        match poll_once(&http, &server, &wal, cursor).await {
            Ok(new_cursor) => {
                cursor = new_cursor.or(cursor);
                registry.record_sync_ok(server_id);
            }
            Err(e) => {
                // The error lands in the status record for operators;
                // the server itself is never disabled by a failed sync.
                registry.set_status(server_id, ServerStatus::Error, Some(e.to_string()));
            }
        }
    }
}

/// One poll cycle: fetch, normalize, append. Returns the new cursor
/// (max started_at seen) once every event is durably appended.
async fn poll_once(
    http: &reqwest::Client,
    server: &ServerConfig,
    wal: &Wal,
    cursor: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    let mut url = format!(
        "{}{}",
        server.base_url.trim_end_matches('/'),
        sessions_path(server.platform)
    );
    if let Some(since) = cursor {
        url.push_str(&format!("?since={}", since.to_rfc3339()));
    }

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Http(format!("poll {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(Error::Http(format!("poll {}: upstream returned {}", url, response.status())));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Http(format!("poll {}: {}", url, e)))?;

    let events = match normalize::normalize_batch(server, &body) {
        Ok(events) => events,
        Err(e) => {
            // Undecodable response: logged and dropped, never written
            // to the WAL.
            warn!(server_id = %server.id, error = %e, "dropping undecodable poll response");
            return Ok(None);
        }
    };

    let mut max_started = cursor;
    let mut appended = 0usize;
    for event in events {
        // The cursor dedupes across cycles; equal timestamps re-fetch
        // and rely on the resolver's idempotent re-delivery handling.
        if let Some(since) = cursor {
            if event.started_at <= since {
                continue;
            }
        }

        let started_at = event.started_at;
        wal.append(&event).await?;
        appended += 1;
        if max_started.map_or(true, |m| started_at > m) {
            max_started = Some(started_at);
        }
    }

    debug!(server_id = %server.id, appended, "poll cycle complete");
    Ok(max_started)
}
