//! Stitch attempt progress tracking.
//!
//! Every attempt opens a handle at start and must end in exactly one of
//! completed or failed. The handle consumes itself on either terminal
//! call; dropping it without one is counted (and logged) as abandoned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::engine::{MergeError, MergeOutput};
use crate::store::EntityRef;

/// Aggregated attempt counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
}

/// Records the lifecycle of stitch attempts.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking one attempt. When `stitch_requested_at` is supplied
    /// the queueing latency (time spent as a deferred marker) is computed
    /// and logged, which is how backlog health is observed.
    pub fn stitch_start(
        &self,
        entity_ref: &EntityRef,
        stitch_requested_at: Option<DateTime<Utc>>,
    ) -> StitchAttempt<'_> {
        self.started.fetch_add(1, Ordering::Relaxed);

        let queue_latency =
            stitch_requested_at.map(|t| (Utc::now() - t).to_std().unwrap_or_default());
        if let Some(latency) = queue_latency {
            debug!(
                entity_ref = %entity_ref,
                queue_latency_ms = latency.as_millis() as u64,
                "Dequeued stitch attempt"
            );
        }

        StitchAttempt {
            tracker: self,
            entity_ref: entity_ref.clone(),
            started: Instant::now(),
            queue_latency,
            finished: false,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Handle bound to one in-flight stitch attempt.
pub struct StitchAttempt<'a> {
    tracker: &'a ProgressTracker,
    entity_ref: EntityRef,
    started: Instant,
    queue_latency: Option<Duration>,
    finished: bool,
}

impl StitchAttempt<'_> {
    /// Record a successful merge.
    pub fn complete(mut self, output: &MergeOutput) {
        self.finished = true;
        self.tracker.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            entity_ref = %self.entity_ref,
            components = output.components_merged,
            duration_ms = self.started.elapsed().as_millis() as u64,
            queue_latency_ms = self.queue_latency.map(|l| l.as_millis() as u64),
            "Entity stitched"
        );
    }

    /// Record a failed merge.
    pub fn fail(mut self, error: &MergeError) {
        self.finished = true;
        self.tracker.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            entity_ref = %self.entity_ref,
            duration_ms = self.started.elapsed().as_millis() as u64,
            error = %error,
            "Stitch attempt failed"
        );
    }
}

impl Drop for StitchAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(
                entity_ref = %self.entity_ref,
                "Stitch attempt dropped without an outcome"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(entity_ref: &str) -> MergeOutput {
        MergeOutput {
            entity_ref: entity_ref.to_string(),
            components_merged: 1,
            document: json!({}),
        }
    }

    #[test]
    fn test_complete_counts_once() {
        let tracker = ProgressTracker::new();
        let attempt = tracker.stitch_start(&"entity/1".to_string(), None);
        attempt.complete(&output("entity/1"));

        assert_eq!(
            tracker.snapshot(),
            ProgressSnapshot {
                started: 1,
                completed: 1,
                failed: 0,
                abandoned: 0,
            }
        );
    }

    #[test]
    fn test_fail_counts_once() {
        let tracker = ProgressTracker::new();
        let attempt = tracker.stitch_start(&"entity/1".to_string(), None);
        attempt.fail(&MergeError::EntityNotFound("entity/1".to_string()));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.completed, 0);
        assert_eq!(snapshot.abandoned, 0);
    }

    #[test]
    fn test_dropped_attempt_counts_as_abandoned() {
        let tracker = ProgressTracker::new();
        {
            let _attempt = tracker.stitch_start(&"entity/1".to_string(), None);
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.started, 1);
        assert_eq!(snapshot.abandoned, 1);
    }

    #[test]
    fn test_queue_latency_from_requested_at() {
        let tracker = ProgressTracker::new();
        let requested_at = Utc::now() - chrono::Duration::seconds(5);
        let attempt = tracker.stitch_start(&"entity/1".to_string(), Some(requested_at));

        assert!(attempt.queue_latency.unwrap() >= Duration::from_secs(4));
        attempt.complete(&output("entity/1"));
    }

    #[test]
    fn test_future_requested_at_clamps_to_zero() {
        let tracker = ProgressTracker::new();
        let requested_at = Utc::now() + chrono::Duration::seconds(60);
        let attempt = tracker.stitch_start(&"entity/1".to_string(), Some(requested_at));

        assert_eq!(attempt.queue_latency.unwrap(), Duration::ZERO);
        attempt.complete(&output("entity/1"));
    }
}
