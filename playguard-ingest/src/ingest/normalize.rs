//! Upstream payload normalization
//!
//! Each platform reports sessions in its own shape; this module
//! validates and converts them into the common RawEvent. Malformed
//! payloads are rejected with an ingestion validation error and never
//! reach the WAL.

use chrono::{DateTime, TimeZone, Utc};
use playguard_common::types::{IngestMode, Platform, RawEvent, ServerConfig};
use playguard_common::{Error, Result};
use serde::Deserialize;

/// Optional geolocation block some upstreams attach to sessions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoBlock {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

/// Plex-style session payload (camelCase, nested Account/Player blocks)
#[derive(Debug, Deserialize)]
pub struct PlexSession {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "Account")]
    pub account: PlexAccount,
    #[serde(rename = "Player")]
    pub player: PlexPlayer,
    #[serde(rename = "Metadata")]
    pub metadata: PlexMetadata,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "stoppedAt", default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(rename = "Location", default)]
    pub location: Option<GeoBlock>,
}

#[derive(Debug, Deserialize)]
pub struct PlexAccount {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct PlexPlayer {
    #[serde(rename = "publicAddress")]
    pub public_address: String,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlexMetadata {
    pub title: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

/// Jellyfin-style session payload (PascalCase, flat)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JellyfinSession {
    pub id: String,
    pub user_name: String,
    pub now_playing_item: JellyfinItem,
    pub remote_end_point: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: Option<GeoBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JellyfinItem {
    pub name: String,
    #[serde(rename = "Type")]
    pub item_type: String,
}

/// Tautulli-style activity payload (snake_case, unix timestamps,
/// geolocation included)
#[derive(Debug, Deserialize)]
pub struct TautulliSession {
    pub session_key: String,
    pub user: String,
    pub ip_address: String,
    pub full_title: String,
    pub media_type: String,
    /// Unix seconds
    pub started: i64,
    /// Unix seconds, 0 or absent while playing
    #[serde(default)]
    pub stopped: Option<i64>,
    #[serde(default)]
    pub player: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

/// Normalize one platform-native payload into a RawEvent.
pub fn normalize(server: &ServerConfig, mode: IngestMode, body: &[u8]) -> Result<RawEvent> {
    let event = match server.platform {
        Platform::Plex => normalize_plex(server, mode, body)?,
        Platform::Jellyfin => normalize_jellyfin(server, mode, body)?,
        Platform::Tautulli => normalize_tautulli(server, mode, body)?,
    };
    validate(&event)?;
    Ok(event)
}

/// Normalize a polled batch: a JSON array of platform-native sessions.
///
/// A malformed item is logged and skipped; it never poisons the rest
/// of the batch. An unparseable response body fails the whole cycle.
pub fn normalize_batch(server: &ServerConfig, body: &[u8]) -> Result<Vec<RawEvent>> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| Error::IngestionValidation(format!("poll response is not a JSON array: {}", e)))?;

    let mut events = Vec::with_capacity(values.len());
    for value in values {
        let bytes = serde_json::to_vec(&value)
            .map_err(|e| Error::IngestionValidation(e.to_string()))?;
        match normalize(server, IngestMode::Poll, &bytes) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(server_id = %server.id, error = %e, "dropping malformed session in poll batch");
            }
        }
    }
    Ok(events)
}

fn normalize_plex(server: &ServerConfig, mode: IngestMode, body: &[u8]) -> Result<RawEvent> {
    let session: PlexSession = serde_json::from_slice(body)
        .map_err(|e| Error::IngestionValidation(format!("malformed plex payload: {}", e)))?;

    let geo = session.location.unwrap_or_default();
    Ok(RawEvent {
        server_id: server.id,
        platform: server.platform,
        session_key: session.session_key,
        user: session.account.title,
        media_title: session.metadata.title,
        media_type: session.metadata.media_type,
        started_at: session.started_at,
        stopped_at: session.stopped_at,
        ip_address: session.player.public_address,
        city: geo.city,
        country: geo.country,
        latitude: geo.latitude,
        longitude: geo.longitude,
        device: session.player.device,
        player: session.player.product,
        ingest_mode: mode,
        received_at: Utc::now(),
    })
}

fn normalize_jellyfin(server: &ServerConfig, mode: IngestMode, body: &[u8]) -> Result<RawEvent> {
    let session: JellyfinSession = serde_json::from_slice(body)
        .map_err(|e| Error::IngestionValidation(format!("malformed jellyfin payload: {}", e)))?;

    let geo = session.location.unwrap_or_default();
    Ok(RawEvent {
        server_id: server.id,
        platform: server.platform,
        session_key: session.id,
        user: session.user_name,
        media_title: session.now_playing_item.name,
        media_type: session.now_playing_item.item_type.to_lowercase(),
        started_at: session.start_time,
        stopped_at: session.end_time,
        ip_address: session.remote_end_point,
        city: geo.city,
        country: geo.country,
        latitude: geo.latitude,
        longitude: geo.longitude,
        device: session.device_name,
        player: session.client,
        ingest_mode: mode,
        received_at: Utc::now(),
    })
}

fn normalize_tautulli(server: &ServerConfig, mode: IngestMode, body: &[u8]) -> Result<RawEvent> {
    let session: TautulliSession = serde_json::from_slice(body)
        .map_err(|e| Error::IngestionValidation(format!("malformed tautulli payload: {}", e)))?;

    let started_at = Utc
        .timestamp_opt(session.started, 0)
        .single()
        .ok_or_else(|| Error::IngestionValidation(format!("bad start timestamp {}", session.started)))?;
    let stopped_at = match session.stopped {
        Some(ts) if ts > 0 => Some(
            Utc.timestamp_opt(ts, 0)
                .single()
                .ok_or_else(|| Error::IngestionValidation(format!("bad stop timestamp {}", ts)))?,
        ),
        _ => None,
    };

    Ok(RawEvent {
        server_id: server.id,
        platform: server.platform,
        session_key: session.session_key,
        user: session.user,
        media_title: session.full_title,
        media_type: session.media_type,
        started_at,
        stopped_at,
        ip_address: session.ip_address,
        city: session.city,
        country: session.country,
        latitude: session.latitude,
        longitude: session.longitude,
        device: None,
        player: session.player,
        ingest_mode: mode,
        received_at: Utc::now(),
    })
}

fn validate(event: &RawEvent) -> Result<()> {
    if event.user.trim().is_empty() {
        return Err(Error::IngestionValidation("missing user identity".into()));
    }
    if event.media_title.trim().is_empty() {
        return Err(Error::IngestionValidation("missing media title".into()));
    }
    if event.session_key.trim().is_empty() {
        return Err(Error::IngestionValidation("missing session key".into()));
    }
    if let Some(stopped) = event.stopped_at {
        if stopped < event.started_at {
            return Err(Error::IngestionValidation(format!(
                "session stops before it starts ({} < {})",
                stopped, event.started_at
            )));
        }
    }
    Ok(())
}
