//! Generic bounded-concurrency polling pipeline.
//!
//! Pulls tasks from a [`TaskSource`] and runs them concurrently on the
//! tokio runtime. In-flight work is bounded by a high watermark; new work
//! is pulled only once the in-flight count drains to the low watermark,
//! so a slow downstream stalls intake instead of ballooning memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info};

/// Watermarks and poll cadence for a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Refill trigger: more work is pulled once the in-flight count drops
    /// to this.
    pub low_watermark: usize,

    /// Upper bound on concurrently running tasks.
    pub high_watermark: usize,

    /// How long to wait before asking for work again after an empty load.
    pub poll_interval: Duration,
}

/// Supplies and executes pipeline tasks.
#[async_trait]
pub trait TaskSource: Send + Sync + 'static {
    type Task: Send + 'static;

    /// Load up to `count` tasks. An empty vec signals an idle tick.
    /// Infrastructure failures must be handled here (logged, mapped to
    /// empty) so the pipeline keeps polling.
    async fn load_tasks(&self, count: usize) -> Vec<Self::Task>;

    /// Execute one task. Task-level failures are the source's
    /// responsibility; nothing is propagated back to the pipeline.
    async fn process_task(&self, task: Self::Task);
}

/// Controller for a running pipeline. Stopping consumes the handle.
pub struct PipelineHandle {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stop the pipeline. No new work is pulled once the signal lands;
    /// tasks already in flight run to completion before this returns.
    pub async fn stop(self) -> Result<(), JoinError> {
        let _ = self.stop_tx.send(()).await;
        self.task.await
    }
}

/// Start a pipeline over `source`. Runs until the handle is stopped.
pub fn start_pipeline<S: TaskSource>(config: PipelineConfig, source: Arc<S>) -> PipelineHandle {
    let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
    let task = tokio::spawn(run_pipeline(config, source, stop_rx));
    PipelineHandle { stop_tx, task }
}

async fn run_pipeline<S: TaskSource>(
    config: PipelineConfig,
    source: Arc<S>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut in_flight: JoinSet<()> = JoinSet::new();
    info!(
        low = config.low_watermark,
        high = config.high_watermark,
        "Pipeline started"
    );

    loop {
        // Reap finished tasks without blocking.
        while in_flight.try_join_next().is_some() {}

        if in_flight.len() <= config.low_watermark {
            let want = config.high_watermark - in_flight.len();
            let tasks = source.load_tasks(want).await;

            if tasks.is_empty() {
                // Idle tick: wait out the poll interval, staying
                // responsive to stop.
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
                continue;
            }

            debug!(
                count = tasks.len(),
                in_flight = in_flight.len(),
                "Loaded pipeline tasks"
            );
            for task in tasks {
                let source = source.clone();
                in_flight.spawn(async move { source.process_task(task).await });
            }
        } else {
            // Saturated: wait for a slot to free up or a stop signal.
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = in_flight.join_next() => {}
            }
        }
    }

    let remaining = in_flight.len();
    if remaining > 0 {
        debug!(remaining, "Draining in-flight pipeline tasks");
    }
    while in_flight.join_next().await.is_some() {}

    info!("Pipeline stopped");
}
