//! The stitching orchestrator.
//!
//! Owns the resolved strategy, the progress tracker and, under the
//! deferred strategy, the lifecycle of the background polling pipeline.
//!
//! Dispatch policy, decided once per `stitch` call:
//! - immediate: every requested entity is stitched inline, sequentially
//! - deferred: requests are durably marked and picked up later by the
//!   polling pipeline

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::engine::MergeEngine;
use crate::store::{DeferredStitchItem, EntityId, EntityRef, StitchStore, StitchTicket, StoreError};

use super::pipeline::{start_pipeline, PipelineConfig, PipelineHandle, TaskSource};
use super::progress::ProgressTracker;
use super::strategy::StitchingStrategy;

/// Ids are resolved to refs in lookups of at most this many ids, keeping
/// the `IN` predicate width bounded for arbitrarily large requests.
pub const ID_CHUNK_SIZE: usize = 100;

/// In-flight bounds for the deferred pipeline.
const PIPELINE_LOW_WATERMARK: usize = 2;
const PIPELINE_HIGH_WATERMARK: usize = 5;

/// A batch of entities to stitch. Refs and ids are unioned; order and
/// duplicates carry no meaning.
#[derive(Debug, Clone, Default)]
pub struct StitchRequest {
    pub entity_refs: Vec<EntityRef>,
    pub entity_ids: Vec<EntityId>,
}

impl StitchRequest {
    pub fn for_refs<I, S>(refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityRef>,
    {
        Self {
            entity_refs: refs.into_iter().map(Into::into).collect(),
            entity_ids: Vec::new(),
        }
    }

    pub fn for_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        Self {
            entity_refs: Vec::new(),
            entity_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_refs.is_empty() && self.entity_ids.is_empty()
    }
}

/// Orchestrator errors. Per-entity merge failures never surface here;
/// only storage failures and lifecycle misuse do.
#[derive(Debug, Error)]
pub enum StitcherError {
    /// `start` was called while a pipeline handle already exists. This is
    /// a programmer error: silently ignoring it would leak a duplicate
    /// background poller.
    #[error("Stitch pipeline is already running")]
    PipelineAlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Stitch pipeline task failed: {0}")]
    Pipeline(#[from] tokio::task::JoinError),
}

/// Entity stitching orchestrator.
pub struct EntityStitcher {
    strategy: StitchingStrategy,
    store: Arc<dyn StitchStore>,
    engine: Arc<dyn MergeEngine>,
    tracker: Arc<ProgressTracker>,
    pipeline: Mutex<Option<PipelineHandle>>,
}

impl EntityStitcher {
    pub fn new(
        strategy: StitchingStrategy,
        store: Arc<dyn StitchStore>,
        engine: Arc<dyn MergeEngine>,
    ) -> Self {
        Self {
            strategy,
            store,
            engine,
            tracker: Arc::new(ProgressTracker::new()),
            pipeline: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> StitchingStrategy {
        self.strategy
    }

    /// Attempt counters, for observability.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Request stitching for a batch of entities.
    ///
    /// Fire-and-forget under both strategies: the caller gets no
    /// completion signal, and per-entity merge failures are recorded by
    /// the tracker rather than returned. Only storage failures (the
    /// marker write in deferred mode, an id lookup in immediate mode)
    /// surface as errors.
    #[instrument(
        skip(self, request),
        fields(refs = request.entity_refs.len(), ids = request.entity_ids.len())
    )]
    pub async fn stitch(&self, request: StitchRequest) -> Result<(), StitcherError> {
        match self.strategy {
            StitchingStrategy::Deferred { .. } => {
                debug!("Marking entities for deferred stitching");
                self.store
                    .mark_for_stitching(&request.entity_refs, &request.entity_ids)
                    .await?;
            }
            StitchingStrategy::Immediate => {
                for entity_ref in &request.entity_refs {
                    stitch_one(self.engine.as_ref(), &self.tracker, entity_ref, None, None).await;
                }
                for chunk in request.entity_ids.chunks(ID_CHUNK_SIZE) {
                    let refs = self.store.resolve_entity_ids(chunk).await?;
                    for entity_ref in &refs {
                        stitch_one(self.engine.as_ref(), &self.tracker, entity_ref, None, None)
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Start the background polling pipeline.
    ///
    /// No-op under the immediate strategy. Fails without side effects if
    /// a pipeline is already running.
    pub async fn start(&self) -> Result<(), StitcherError> {
        let StitchingStrategy::Deferred {
            polling_interval,
            stitch_timeout,
        } = self.strategy
        else {
            return Ok(());
        };

        let mut slot = self.pipeline.lock().await;
        if slot.is_some() {
            return Err(StitcherError::PipelineAlreadyRunning);
        }

        let source = Arc::new(DeferredStitchSource {
            store: self.store.clone(),
            engine: self.engine.clone(),
            tracker: self.tracker.clone(),
            stitch_timeout,
        });
        let config = PipelineConfig {
            low_watermark: PIPELINE_LOW_WATERMARK,
            high_watermark: PIPELINE_HIGH_WATERMARK,
            poll_interval: polling_interval,
        };
        *slot = Some(start_pipeline(config, source));

        Ok(())
    }

    /// Stop the background pipeline if one is running; no-op otherwise.
    /// In-flight stitches run to completion before this returns.
    pub async fn stop(&self) -> Result<(), StitcherError> {
        let handle = self.pipeline.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await?;
        }
        Ok(())
    }
}

/// Stitch exactly one entity and record the outcome.
///
/// The fault isolation boundary for a unit of work: nothing escapes, so a
/// malformed or unavailable entity cannot take its siblings or the
/// pipeline down with it.
pub(crate) async fn stitch_one(
    engine: &dyn MergeEngine,
    tracker: &ProgressTracker,
    entity_ref: &EntityRef,
    ticket: Option<&StitchTicket>,
    requested_at: Option<DateTime<Utc>>,
) {
    let attempt = tracker.stitch_start(entity_ref, requested_at);
    match engine.perform_stitching(entity_ref, ticket).await {
        Ok(output) => attempt.complete(&output),
        Err(error) => attempt.fail(&error),
    }
}

/// Task source feeding the deferred pipeline from the marker store.
struct DeferredStitchSource {
    store: Arc<dyn StitchStore>,
    engine: Arc<dyn MergeEngine>,
    tracker: Arc<ProgressTracker>,
    stitch_timeout: Duration,
}

#[async_trait]
impl TaskSource for DeferredStitchSource {
    type Task = DeferredStitchItem;

    async fn load_tasks(&self, count: usize) -> Vec<DeferredStitchItem> {
        match self.store.stitchable_entities(count, self.stitch_timeout).await {
            Ok(items) => items,
            Err(error) => {
                // Transient infrastructure failure: skip this tick and
                // poll again.
                warn!(%error, "Failed to load stitchable entities");
                Vec::new()
            }
        }
    }

    async fn process_task(&self, item: DeferredStitchItem) {
        stitch_one(
            self.engine.as_ref(),
            &self.tracker,
            &item.entity_ref,
            item.stitch_ticket.as_ref(),
            item.stitch_requested_at,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let request = StitchRequest::for_refs(["entity/1", "entity/2"]);
        assert_eq!(request.entity_refs.len(), 2);
        assert!(request.entity_ids.is_empty());

        let request = StitchRequest::for_ids(["id-1"]);
        assert_eq!(request.entity_ids.len(), 1);
        assert!(!request.is_empty());

        assert!(StitchRequest::default().is_empty());
    }
}
