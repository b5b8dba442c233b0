//! Polling Pipeline Integration Tests
//!
//! Tests for watermark behavior and lifecycle of the generic
//! bounded-concurrency pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use stitcher::{start_pipeline, PipelineConfig, TaskSource};

/// Source that hands out numbered tasks and tracks concurrency.
struct CountingSource {
    tasks: Mutex<Vec<u32>>,
    processed: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    fn with_tasks(count: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new((0..count).collect()),
            processed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay,
        })
    }

    fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskSource for CountingSource {
    type Task = u32;

    async fn load_tasks(&self, count: usize) -> Vec<u32> {
        let mut tasks = self.tasks.lock().unwrap();
        let take = tasks.len().min(count);
        tasks.drain(..take).collect()
    }

    async fn process_task(&self, _task: u32) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(low: usize, high: usize, poll_ms: u64) -> PipelineConfig {
    PipelineConfig {
        low_watermark: low,
        high_watermark: high,
        poll_interval: Duration::from_millis(poll_ms),
    }
}

/// Poll until `condition` holds, or panic after two seconds.
async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for: {what}");
}

#[tokio::test]
async fn test_processes_all_tasks() {
    let source = CountingSource::with_tasks(12, Duration::from_millis(5));
    let handle = start_pipeline(config(2, 5, 10), source.clone());

    wait_until(|| source.processed() == 12, "all tasks to be processed").await;
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_never_exceeds_high_watermark() {
    let source = CountingSource::with_tasks(20, Duration::from_millis(30));
    let handle = start_pipeline(config(2, 5, 10), source.clone());

    wait_until(|| source.processed() == 20, "all tasks to be processed").await;
    handle.stop().await.unwrap();

    let max_active = source.max_active.load(Ordering::SeqCst);
    assert!(max_active <= 5, "max in-flight was {max_active}");
    assert!(max_active >= 2, "pipeline never reached the low watermark");
}

#[tokio::test]
async fn test_stop_drains_in_flight_tasks() {
    let source = CountingSource::with_tasks(5, Duration::from_millis(100));
    let handle = start_pipeline(config(2, 5, 10), source.clone());

    // Let the first load pull everything into flight, then stop.
    wait_until(|| source.tasks.lock().unwrap().is_empty(), "tasks to be loaded").await;
    handle.stop().await.unwrap();

    assert_eq!(source.processed(), 5);
    assert_eq!(source.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_idle_pipeline_stops_promptly() {
    // A long poll interval must not delay shutdown.
    let source = CountingSource::with_tasks(0, Duration::ZERO);
    let handle = start_pipeline(config(2, 5, 5_000), source.clone());

    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    handle.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}
