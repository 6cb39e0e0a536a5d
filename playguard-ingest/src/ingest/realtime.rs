//! Realtime-channel ingestion worker
//!
//! Holds a persistent WebSocket connection to the upstream server and
//! normalizes every pushed session payload into the WAL. Connection
//! drops reconnect with bounded exponential backoff; the retry
//! frequency is capped so a flapping upstream cannot turn into a
//! reconnect storm.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use playguard_common::types::{IngestMode, Platform, ServerStatus};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ingest::normalize;
use crate::registry::Registry;
use crate::wal::Wal;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Platform-specific notification channel path.
fn channel_path(platform: Platform) -> &'static str {
    match platform {
        Platform::Plex => "/:/websockets/notifications",
        Platform::Jellyfin => "/socket",
        Platform::Tautulli => "/ws",
    }
}

/// Long-running realtime worker for one server. Exits when the server
/// is deleted, disabled, or the realtime channel is turned off.
pub async fn run_realtime_worker(server_id: Uuid, registry: Arc<Registry>, wal: Arc<Wal>) {
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

    info!(server_id = %server_id, "realtime worker started");

    loop {
        let server = match registry.get_server(server_id).await {
            Ok(Some(server)) if server.enabled && server.realtime_enabled => server,
            Ok(_) => {
                info!(server_id = %server_id, "realtime worker stopping: server disabled or removed");
                return;
            }
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "realtime worker config read failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let ws_url = websocket_url(&server.base_url, server.platform);
        registry.set_status(server_id, ServerStatus::Connecting, None);

        match connect_async(ws_url.as_str()).await {
            Ok((mut stream, _)) => {
                info!(server_id = %server_id, url = %ws_url, "realtime channel connected");
                registry.set_status(server_id, ServerStatus::Connected, None);
                reconnect_delay = INITIAL_RECONNECT_DELAY;

                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            handle_push(&server, &wal, &registry, text.as_bytes()).await;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
                        Ok(Message::Close(_)) => {
                            warn!(server_id = %server_id, "realtime channel closed by upstream");
                            break;
                        }
                        Ok(Message::Frame(_)) => {}
                        Err(e) => {
                            warn!(server_id = %server_id, error = %e, "realtime channel error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                registry.set_status(server_id, ServerStatus::Error, Some(e.to_string()));
            }
        }

        debug!(server_id = %server_id, delay = ?reconnect_delay, "reconnecting realtime channel");
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

/// Normalize one pushed payload and append it. Append failures are
/// retried a few times; a final failure is surfaced in the server's
/// status record, it is never silent.
async fn handle_push(
    server: &playguard_common::types::ServerConfig,
    wal: &Wal,
    registry: &Registry,
    body: &[u8],
) {
    let event = match normalize::normalize(server, IngestMode::Realtime, body) {
        Ok(event) => event,
        Err(e) => {
            warn!(server_id = %server.id, error = %e, "dropping malformed realtime payload");
            return;
        }
    };

    for attempt in 1..=3 {
        match wal.append(&event).await {
            Ok(seq) => {
                debug!(server_id = %server.id, seq, "realtime event appended");
                registry.record_sync_ok(server.id);
                return;
            }
            Err(e) if attempt < 3 => {
                warn!(server_id = %server.id, attempt, error = %e, "WAL append failed, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(e) => {
                registry.set_status(
                    server.id,
                    ServerStatus::Error,
                    Some(format!("WAL append failed: {}", e)),
                );
            }
        }
    }
}

fn websocket_url(base_url: &str, platform: Platform) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_url)
    };
    format!("{}{}", ws_base.trim_end_matches('/'), channel_path(platform))
}
