//! Integration tests for configuration loading

use playguard_common::config::{load_config, resolve_database_path, FileConfig};
use playguard_common::types::{Platform, ServerSource};
use std::io::Write;
use std::path::Path;

#[test]
fn test_load_config_with_declared_servers() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
database_path = "/var/lib/playguard/playguard.db"
port = 5760

[[servers]]
name = "living-room-plex"
platform = "plex"
base_url = "http://plex.local:32400"
realtime_enabled = true
webhook_enabled = true

[[servers]]
name = "tautulli"
platform = "tautulli"
base_url = "http://tautulli.local:8181"
polling_enabled = true
polling_interval_secs = 60
"#
    )
    .unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.port, Some(5760));
    assert_eq!(config.servers.len(), 2);

    let plex = config.servers[0].clone().into_server_config().unwrap();
    assert_eq!(plex.platform, Platform::Plex);
    assert_eq!(plex.source, ServerSource::Declared);
    assert!(plex.realtime_enabled);
    assert!(plex.webhook_enabled);
    assert!(!plex.polling_enabled);

    let tautulli = config.servers[1].clone().into_server_config().unwrap();
    assert_eq!(tautulli.platform, Platform::Tautulli);
    assert!(tautulli.polling_enabled);
    assert_eq!(tautulli.polling_interval_secs, 60);
}

#[test]
fn test_load_config_missing_file() {
    assert!(load_config(Path::new("/nonexistent/playguard.toml")).is_err());
}

#[test]
fn test_database_path_priority() {
    let file_config = FileConfig {
        database_path: Some("/from/file.db".into()),
        port: None,
        servers: vec![],
    };

    // CLI argument wins over everything
    let resolved = resolve_database_path(
        Some(Path::new("/from/cli.db")),
        "PLAYGUARD_TEST_DB_UNSET",
        Some(&file_config),
    );
    assert_eq!(resolved, Path::new("/from/cli.db"));

    // File config is used when CLI and env are absent
    let resolved = resolve_database_path(None, "PLAYGUARD_TEST_DB_UNSET", Some(&file_config));
    assert_eq!(resolved, Path::new("/from/file.db"));

    // Compiled default as last resort
    let resolved = resolve_database_path(None, "PLAYGUARD_TEST_DB_UNSET", None);
    assert_eq!(resolved, Path::new("playguard.db"));
}

#[test]
fn test_declared_ids_stable_across_loads() {
    let decl = playguard_common::config::DeclaredServer {
        name: "attic-jellyfin".into(),
        platform: "jellyfin".into(),
        base_url: "http://jellyfin.local:8096".into(),
        enabled: true,
        webhook_enabled: false,
        realtime_enabled: true,
        polling_enabled: false,
        polling_interval_secs: 60,
    };
    let a = decl.clone().into_server_config().unwrap();
    let b = decl.into_server_config().unwrap();
    assert_eq!(a.id, b.id);
}
