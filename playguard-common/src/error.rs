//! Common error types for Playguard
//!
//! Defines the pipeline-wide error taxonomy using thiserror for clear
//! error propagation.

use thiserror::Error;

/// Common result type for Playguard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the Playguard pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed upstream payload. The event is logged and dropped;
    /// it never reaches the WAL.
    #[error("Ingestion validation error: {0}")]
    IngestionValidation(String),

    /// WAL append failure. Fatal to the ingestion attempt; the caller
    /// must retry the whole ingestion, not continue.
    #[error("WAL append error: {0}")]
    WalAppend(String),

    /// WAL commit failure. Transient; retried with backoff up to a cap,
    /// then surfaced as a persistent failed entry.
    #[error("WAL commit error: {0}")]
    WalCommit(String),

    /// Administrative mutation attempted on a declared server entry
    #[error("Immutable configuration: {0}")]
    ImmutableConfig(String),

    /// Administered server deletion rejected while WAL entries for it
    /// are still pending commit
    #[error("Pending WAL entries: {0}")]
    PendingWalEntries(String),

    /// Candidate grouping could not determine a single canonical event
    #[error("Dedup ambiguity: {0}")]
    DedupAmbiguity(String),

    /// A single detection rule failed; isolated from the other rules
    #[error("Rule evaluation error: {0}")]
    RuleEvaluation(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Upstream HTTP or WebSocket error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
