//! Configuration loading for the Playguard pipeline
//!
//! Declared servers are read from a TOML file at process start and are
//! immutable for the process lifetime. Administered servers live in
//! the database and are managed through the admin API.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

use crate::types::{Platform, ServerConfig, ServerSource};
use crate::{Error, Result};

/// Top-level TOML configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// Path to the SQLite database
    pub database_path: Option<PathBuf>,

    /// HTTP listen port
    pub port: Option<u16>,

    /// Environment-declared servers, immutable for the process lifetime
    #[serde(default)]
    pub servers: Vec<DeclaredServer>,
}

/// One declared server entry from the config file
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredServer {
    pub name: String,
    /// One of: plex, jellyfin, tautulli
    pub platform: String,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub realtime_enabled: bool,
    #[serde(default)]
    pub polling_enabled: bool,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_polling_interval() -> u64 {
    60
}

impl DeclaredServer {
    /// Convert to a registry entry. Declared entries get a stable id
    /// derived from their name so restarts keep WAL entries attached
    /// to the same server.
    pub fn into_server_config(self) -> Result<ServerConfig> {
        let platform = Platform::parse(&self.platform)?;
        if self.base_url.is_empty() {
            return Err(Error::Config(format!(
                "declared server '{}' has an empty base_url",
                self.name
            )));
        }
        Ok(ServerConfig {
            id: stable_server_id(&self.name),
            platform,
            name: self.name,
            base_url: self.base_url,
            source: ServerSource::Declared,
            enabled: self.enabled,
            webhook_enabled: self.webhook_enabled,
            realtime_enabled: self.realtime_enabled,
            polling_enabled: self.polling_enabled,
            polling_interval_secs: self.polling_interval_secs,
        })
    }
}

/// Derive a stable UUID for a declared server from its name.
///
/// Declared servers have no persisted row, so the id must be
/// reproducible across restarts for WAL entries to stay attached.
fn stable_server_id(name: &str) -> Uuid {
    let mut bytes = [0u8; 16];
    for (i, b) in name.bytes().enumerate() {
        bytes[i % 16] = bytes[i % 16].wrapping_mul(31).wrapping_add(b);
    }
    // Set version 4 / RFC variant bits so the id is a well-formed UUID
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Load the TOML configuration file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("invalid config: {}", e)))
}

/// Resolve the database path following the priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. Compiled default (fallback)
pub fn resolve_database_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_config: Option<&FileConfig>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(env_var_name) {
        return PathBuf::from(path);
    }
    if let Some(path) = file_config.and_then(|c| c.database_path.clone()) {
        return path;
    }
    PathBuf::from("playguard.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_server_id_is_deterministic() {
        assert_eq!(stable_server_id("living-room"), stable_server_id("living-room"));
        assert_ne!(stable_server_id("living-room"), stable_server_id("attic"));
    }

    #[test]
    fn declared_server_rejects_unknown_platform() {
        let decl = DeclaredServer {
            name: "s".into(),
            platform: "winamp".into(),
            base_url: "http://localhost".into(),
            enabled: true,
            webhook_enabled: false,
            realtime_enabled: false,
            polling_enabled: true,
            polling_interval_secs: 60,
        };
        assert!(decl.into_server_config().is_err());
    }
}
