//! Storage collaborator interface for stitching.
//!
//! The orchestrator never touches persistence directly. Durable "needs
//! stitching" markers, lease-based selection of deferred work, and id to
//! ref resolution all go through the [`StitchStore`] trait; the SQLite
//! implementation lives in [`sqlite`].

pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::{BacklogSummary, SqliteStitchStore};

/// Stable reference addressing a materialized entity.
pub type EntityRef = String;

/// Ingestion-side identifier, resolvable to an [`EntityRef`].
pub type EntityId = String;

/// Optimistic-concurrency token attached to a pending stitch marker.
///
/// Re-marking an entity issues a fresh ticket; a merge carrying a ticket
/// that no longer matches the marker row is stale and must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchTicket(String);

impl StitchTicket {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StitchTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for StitchTicket {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl std::fmt::Display for StitchTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A deferred work item loaded from the marker store.
#[derive(Debug, Clone)]
pub struct DeferredStitchItem {
    /// Entity to stitch.
    pub entity_ref: EntityRef,

    /// Ticket of the marker this item was loaded from, passed back to the
    /// merge engine so stale work can be detected.
    pub stitch_ticket: Option<StitchTicket>,

    /// When stitching was first requested, for queue latency tracking.
    pub stitch_requested_at: Option<DateTime<Utc>>,
}

/// Errors from the marker/entity store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for the orchestrator.
#[async_trait]
pub trait StitchStore: Send + Sync {
    /// Durably record that these entities need (re-)stitching.
    /// Safe to call redundantly.
    async fn mark_for_stitching(
        &self,
        entity_refs: &[EntityRef],
        entity_ids: &[EntityId],
    ) -> Result<(), StoreError>;

    /// Load up to `batch_size` items eligible for stitching: markers that
    /// are unleased, or whose lease expired more than `stitch_timeout`
    /// ago. Selected items are leased before being returned. May return
    /// fewer than requested, including zero.
    async fn stitchable_entities(
        &self,
        batch_size: usize,
        stitch_timeout: Duration,
    ) -> Result<Vec<DeferredStitchItem>, StoreError>;

    /// Resolve ingestion ids to entity refs. Unknown ids are skipped, so
    /// the result may be shorter than the input.
    async fn resolve_entity_ids(&self, entity_ids: &[EntityId]) -> Result<Vec<EntityRef>, StoreError>;
}
