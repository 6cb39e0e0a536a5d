//! Detection rule configurations and checks
//!
//! Each rule is a pure function over the current canonical event and
//! pre-fetched history; the engine owns the history queries and the
//! per-user serialization. A rule that fires returns a `RuleHit` which
//! the engine turns into an Alert.

use std::collections::HashMap;

use chrono::Utc;
use playguard_common::geo::{haversine_km, is_unknown_location};
use playguard_common::time::intervals_overlap;
use playguard_common::types::{DetectionRule, PlaybackEvent, RuleType, Severity};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// A rule firing: message and context for the resulting alert.
#[derive(Debug, Clone)]
pub struct RuleHit {
    pub message: String,
    pub metadata: serde_json::Value,
    pub event_ids: Vec<Uuid>,
}

/// Impossible travel: implied speed between consecutive events exceeds
/// what a commercial flight could cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpossibleTravelConfig {
    /// Maximum plausible travel speed (default 900 km/h, flight speed)
    pub max_speed_kmh: f64,
    /// Minimum distance to trigger; guards against noisy geolocation
    pub min_distance_km: f64,
    /// Minimum elapsed time between events to consider
    pub min_time_delta_minutes: i64,
}

impl Default for ImpossibleTravelConfig {
    fn default() -> Self {
        Self {
            max_speed_kmh: 900.0,
            min_distance_km: 100.0,
            min_time_delta_minutes: 5,
        }
    }
}

/// Concurrent streams: per-user overlapping session limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrentStreamsConfig {
    pub default_limit: i64,
    /// Per-user overrides keyed by user identity
    #[serde(default)]
    pub user_limits: HashMap<String, i64>,
}

impl Default for ConcurrentStreamsConfig {
    fn default() -> Self {
        Self {
            default_limit: 3,
            user_limits: HashMap::new(),
        }
    }
}

impl ConcurrentStreamsConfig {
    pub fn limit_for(&self, user: &str) -> i64 {
        self.user_limits.get(user).copied().unwrap_or(self.default_limit)
    }
}

/// Device velocity: too many distinct network addresses in a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceVelocityConfig {
    pub window_minutes: i64,
    pub max_unique_ips: i64,
}

impl Default for DeviceVelocityConfig {
    fn default() -> Self {
        Self {
            window_minutes: 5,
            max_unique_ips: 3,
        }
    }
}

/// Geo restriction: country blocklist, or allowlist when non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoRestrictionConfig {
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    #[serde(default)]
    pub allowed_countries: Vec<String>,
}

/// Simultaneous locations: sessions starting close in time but far
/// apart in space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimultaneousLocationsConfig {
    pub window_minutes: i64,
    pub min_distance_km: f64,
}

impl Default for SimultaneousLocationsConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            min_distance_km: 50.0,
        }
    }
}

/// Default rule set installed on first run.
pub fn default_rules() -> Vec<DetectionRule> {
    let now = Utc::now();
    vec![
        DetectionRule {
            rule_type: RuleType::ImpossibleTravel,
            enabled: true,
            config: serde_json::to_value(ImpossibleTravelConfig::default()).unwrap_or(json!({})),
            severity: Severity::Critical,
            updated_at: now,
        },
        DetectionRule {
            rule_type: RuleType::ConcurrentStreams,
            enabled: true,
            config: serde_json::to_value(ConcurrentStreamsConfig::default()).unwrap_or(json!({})),
            severity: Severity::Warning,
            updated_at: now,
        },
        DetectionRule {
            rule_type: RuleType::DeviceVelocity,
            enabled: true,
            config: serde_json::to_value(DeviceVelocityConfig::default()).unwrap_or(json!({})),
            severity: Severity::Warning,
            updated_at: now,
        },
        DetectionRule {
            rule_type: RuleType::GeoRestriction,
            enabled: true,
            config: serde_json::to_value(GeoRestrictionConfig::default()).unwrap_or(json!({})),
            severity: Severity::Warning,
            updated_at: now,
        },
        DetectionRule {
            rule_type: RuleType::SimultaneousLocations,
            enabled: true,
            config: serde_json::to_value(SimultaneousLocationsConfig::default()).unwrap_or(json!({})),
            severity: Severity::Critical,
            updated_at: now,
        },
    ]
}

/// Impossible travel check against the immediately preceding event.
///
/// Fires only when all three guards pass: the implied speed exceeds
/// `max_speed_kmh`, the distance is at least `min_distance_km`, and
/// the elapsed time is at least `min_time_delta_minutes`. The distance
/// and time guards suppress false positives from noisy geolocation on
/// near-simultaneous events.
pub fn check_impossible_travel(
    config: &ImpossibleTravelConfig,
    previous: &PlaybackEvent,
    current: &PlaybackEvent,
) -> Option<RuleHit> {
    if is_unknown_location(current.raw.latitude, current.raw.longitude)
        || is_unknown_location(previous.raw.latitude, previous.raw.longitude)
    {
        return None;
    }

    let distance_km = haversine_km(
        previous.raw.latitude,
        previous.raw.longitude,
        current.raw.latitude,
        current.raw.longitude,
    );
    if distance_km < config.min_distance_km {
        return None;
    }

    let elapsed = current.raw.started_at - previous.raw.started_at;
    let elapsed_minutes = elapsed.num_seconds() as f64 / 60.0;
    if elapsed_minutes < config.min_time_delta_minutes as f64 {
        return None;
    }

    let speed_kmh = distance_km / (elapsed_minutes / 60.0);
    if speed_kmh <= config.max_speed_kmh {
        return None;
    }

    Some(RuleHit {
        message: format!(
            "{} appeared {:.0} km away after {:.0} minutes (implied {:.0} km/h)",
            current.raw.user, distance_km, elapsed_minutes, speed_kmh
        ),
        metadata: json!({
            "from_city": previous.raw.city,
            "from_country": previous.raw.country,
            "from_latitude": previous.raw.latitude,
            "from_longitude": previous.raw.longitude,
            "to_city": current.raw.city,
            "to_country": current.raw.country,
            "to_latitude": current.raw.latitude,
            "to_longitude": current.raw.longitude,
            "distance_km": distance_km,
            "time_delta_mins": elapsed_minutes,
            "required_speed_kmh": speed_kmh,
        }),
        event_ids: vec![previous.id, current.id],
    })
}

/// Concurrent streams check over the user's sessions whose intervals
/// overlap the current one. `overlapping` excludes the current event.
pub fn check_concurrent_streams(
    config: &ConcurrentStreamsConfig,
    overlapping: &[PlaybackEvent],
    current: &PlaybackEvent,
) -> Option<RuleHit> {
    let limit = config.limit_for(&current.raw.user);
    let active = overlapping.len() as i64 + 1;
    if active <= limit {
        return None;
    }

    let mut event_ids: Vec<Uuid> = overlapping.iter().map(|e| e.id).collect();
    event_ids.push(current.id);

    Some(RuleHit {
        message: format!(
            "{} has {} concurrent streams (limit {})",
            current.raw.user, active, limit
        ),
        metadata: json!({
            "active_streams": active,
            "stream_limit": limit,
            "session_keys": overlapping
                .iter()
                .map(|e| e.raw.session_key.clone())
                .chain(std::iter::once(current.raw.session_key.clone()))
                .collect::<Vec<_>>(),
        }),
        event_ids,
    })
}

/// Device velocity check over the distinct addresses seen in the
/// trailing window, current event included.
pub fn check_device_velocity(
    config: &DeviceVelocityConfig,
    distinct_ips: &[String],
    current: &PlaybackEvent,
) -> Option<RuleHit> {
    let count = distinct_ips.len() as i64;
    if count <= config.max_unique_ips {
        return None;
    }

    Some(RuleHit {
        message: format!(
            "{} used {} distinct addresses within {} minutes (limit {})",
            current.raw.user, count, config.window_minutes, config.max_unique_ips
        ),
        metadata: json!({
            "ip_addresses": distinct_ips,
            "window_minutes": config.window_minutes,
            "max_unique_ips": config.max_unique_ips,
        }),
        event_ids: vec![current.id],
    })
}

/// Geo restriction check. An empty country on the event never fires.
pub fn check_geo_restriction(
    config: &GeoRestrictionConfig,
    current: &PlaybackEvent,
) -> Option<RuleHit> {
    let country = current.raw.country.as_deref()?;
    if country.is_empty() {
        return None;
    }

    let blocked = config.blocked_countries.iter().any(|c| c == country);
    let outside_allowlist =
        !config.allowed_countries.is_empty() && !config.allowed_countries.iter().any(|c| c == country);

    if !blocked && !outside_allowlist {
        return None;
    }

    Some(RuleHit {
        message: format!(
            "{} streamed from {} which is {}",
            current.raw.user,
            country,
            if blocked { "blocked" } else { "outside the allowlist" }
        ),
        metadata: json!({
            "country": country,
            "blocked": blocked,
            "allowlist_active": !config.allowed_countries.is_empty(),
        }),
        event_ids: vec![current.id],
    })
}

/// Simultaneous locations check: another session for the user starting
/// within the window but located farther than the minimum distance.
/// Catches concurrent-but-not-overlapping sessions from different
/// places. `recent` excludes the current event.
pub fn check_simultaneous_locations(
    config: &SimultaneousLocationsConfig,
    recent: &[PlaybackEvent],
    current: &PlaybackEvent,
) -> Option<RuleHit> {
    if is_unknown_location(current.raw.latitude, current.raw.longitude) {
        return None;
    }

    for other in recent {
        if is_unknown_location(other.raw.latitude, other.raw.longitude) {
            continue;
        }
        let delta = (current.raw.started_at - other.raw.started_at).num_minutes().abs();
        if delta > config.window_minutes {
            continue;
        }
        let distance_km = haversine_km(
            other.raw.latitude,
            other.raw.longitude,
            current.raw.latitude,
            current.raw.longitude,
        );
        if distance_km <= config.min_distance_km {
            continue;
        }

        return Some(RuleHit {
            message: format!(
                "{} active from two locations {:.0} km apart within {} minutes",
                current.raw.user, distance_km, config.window_minutes
            ),
            metadata: json!({
                "other_city": other.raw.city,
                "other_country": other.raw.country,
                "current_city": current.raw.city,
                "current_country": current.raw.country,
                "distance_km": distance_km,
                "window_minutes": config.window_minutes,
            }),
            event_ids: vec![other.id, current.id],
        });
    }

    None
}

/// Overlap predicate used by the engine to build the concurrent-stream
/// candidate set.
pub fn overlaps_current(other: &PlaybackEvent, current: &PlaybackEvent) -> bool {
    other.id != current.id
        && intervals_overlap(
            other.raw.started_at,
            other.raw.stopped_at,
            current.raw.started_at,
            current.raw.stopped_at,
        )
}
