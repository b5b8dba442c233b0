//! Stitching strategy resolution.
//!
//! The strategy is resolved once from configuration and never changes for
//! the lifetime of an orchestrator instance.

use std::time::Duration;

/// How stitch requests are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchingStrategy {
    /// Process requests inline, synchronously with the caller.
    Immediate,

    /// Record requests as durable markers and let the background polling
    /// pipeline pick them up.
    Deferred {
        /// How often the pipeline asks for new work when idle.
        polling_interval: Duration,

        /// Lease duration after which a claimed marker becomes eligible
        /// for reprocessing, recovering from stuck attempts.
        stitch_timeout: Duration,
    },
}

impl StitchingStrategy {
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_STITCH_TIMEOUT: Duration = Duration::from_secs(60);

    /// Resolve a strategy from the configured mode string.
    ///
    /// `"deferred"` selects the polling pipeline with fixed defaults; the
    /// interval and timeout are not configurable yet. Anything else,
    /// including no mode at all, falls back to immediate processing.
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode {
            Some("deferred") => Self::deferred(),
            _ => Self::Immediate,
        }
    }

    /// The deferred strategy with default parameters.
    pub fn deferred() -> Self {
        Self::Deferred {
            polling_interval: Self::DEFAULT_POLLING_INTERVAL,
            stitch_timeout: Self::DEFAULT_STITCH_TIMEOUT,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}
