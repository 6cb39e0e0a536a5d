//! Shared application state

use std::sync::Arc;

use futures::future::BoxFuture;
use playguard_common::events::EventBus;
use playguard_common::types::WalEntry;
use playguard_common::Result;
use sqlx::SqlitePool;

use crate::api::sse::SseBroadcaster;
use crate::dedup::{Resolution, Resolver};
use crate::detect::DetectionEngine;
use crate::ingest::Orchestrator;
use crate::registry::Registry;
use crate::wal::{CommitSink, Wal};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub registry: Arc<Registry>,
    pub wal: Arc<Wal>,
    pub resolver: Arc<Resolver>,
    pub engine: Arc<DetectionEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub broadcaster: SseBroadcaster,
    pub events: EventBus,
    pub port: u16,
}

/// Commit sink joining the dedup resolver and the detection engine:
/// every committed WAL entry resolves to the canonical stream, and
/// events that become canonical flow on into detection. Duplicates
/// stop here; their audit entries were already written by the
/// resolver.
pub struct PipelineSink {
    pub resolver: Arc<Resolver>,
    pub engine: Arc<DetectionEngine>,
}

impl CommitSink for PipelineSink {
    fn deliver<'a>(&'a self, entry: WalEntry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let raw = entry.raw_event()?;
            match self.resolver.resolve(raw).await? {
                Resolution::Canonical(event) => {
                    self.engine.submit(event).await?;
                    Ok(())
                }
                Resolution::Duplicate { .. } | Resolution::AlreadyResolved { .. } => Ok(()),
            }
        })
    }
}
