//! Database access for Playguard
//!
//! Schema creation and pool initialization. Entity-specific queries
//! live with the pipeline crate.

pub mod init;

pub use init::init_database;
