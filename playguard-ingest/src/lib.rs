//! Playguard ingestion pipeline
//!
//! Event integrity and anomaly detection for multi-source media-server
//! telemetry: server registry and ingestion orchestration, write-ahead
//! durability, duplicate resolution with an auditable override trail,
//! and rule-based detection with per-user trust scoring.

pub mod api;
pub mod db;
pub mod dedup;
pub mod detect;
pub mod ingest;
pub mod registry;
pub mod state;
pub mod wal;
