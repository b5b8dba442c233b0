//! Merge engine interface.
//!
//! A [`MergeEngine`] performs the actual stitch for one entity: read the
//! raw ingestion fragments and produce the final materialized document.
//! The orchestrator only schedules this work; implementations own the
//! merge semantics.

pub mod document;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::{EntityRef, StitchTicket, StoreError};

pub use document::DocumentMerger;

/// Output of a successful stitch.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    /// The entity that was stitched.
    pub entity_ref: EntityRef,

    /// How many ingestion fragments went into the document.
    pub components_merged: usize,

    /// The materialized document.
    pub document: serde_json::Value,
}

/// Errors from a single merge attempt.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityRef),

    #[error("Stale stitch ticket for {entity_ref}: {ticket}")]
    StaleTicket {
        entity_ref: EntityRef,
        ticket: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Trait for merge engines.
#[async_trait]
pub trait MergeEngine: Send + Sync {
    /// Human-readable engine name.
    fn name(&self) -> &str;

    /// Merge all ingestion fragments of `entity_ref` into its final
    /// document. A presented ticket must still match the entity's marker;
    /// stale tickets fail the attempt so superseded work is discarded.
    async fn perform_stitching(
        &self,
        entity_ref: &EntityRef,
        ticket: Option<&StitchTicket>,
    ) -> Result<MergeOutput, MergeError>;
}
