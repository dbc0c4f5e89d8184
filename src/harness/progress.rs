//! Batch progress tracking with periodic logging.
//!
//! [`ProgressCounters`] holds atomic counters shared by instance pipelines.
//! [`ProgressMonitor`] runs a background task that periodically logs a
//! summary of those counters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::evaluation::Outcome;

/// Shared atomic counters updated by instance pipelines.
#[derive(Clone, Default)]
pub struct ProgressCounters {
    /// Instances handed to a pipeline.
    pub dispatched: Arc<AtomicUsize>,
    /// Pipelines currently building images.
    pub building: Arc<AtomicUsize>,
    /// Pipelines currently running containers.
    pub running: Arc<AtomicUsize>,
    pub resolved: Arc<AtomicUsize>,
    pub unresolved: Arc<AtomicUsize>,
    pub errors: Arc<AtomicUsize>,
}

/// Point-in-time snapshot of [`ProgressCounters`].
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub dispatched: usize,
    pub building: usize,
    pub running: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub errors: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn completed(&self) -> usize {
        self.resolved + self.unresolved + self.errors
    }
}

/// Decrements a gauge counter when dropped.
pub struct GaugeGuard(Arc<AtomicUsize>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `gauge` until the returned guard is dropped.
    pub fn enter(gauge: &Arc<AtomicUsize>) -> GaugeGuard {
        gauge.fetch_add(1, Ordering::Relaxed);
        GaugeGuard(gauge.clone())
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Resolved => &self.resolved,
            Outcome::Unresolved => &self.unresolved,
            Outcome::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            building: self.building.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs batch progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a background progress monitor that logs every `interval`.
    ///
    /// # Arguments
    ///
    /// * `counters` - Shared counters updated by instance pipelines
    /// * `total` - Number of selected instances (used for progress percentage)
    /// * `interval` - How often to emit progress logs
    pub fn start(counters: ProgressCounters, total: usize, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let completed = snap.completed();
                let pct = if total > 0 {
                    (completed as f64 / total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let per_min = if elapsed_secs > 0.0 {
                    completed as f64 / elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    dispatched = snap.dispatched,
                    building = snap.building,
                    running = snap.running,
                    resolved = snap.resolved,
                    unresolved = snap.unresolved,
                    errors = snap.errors,
                    total = total,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    instances_per_min = format!("{:.2}", per_min),
                    "Batch progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_record_outcomes() {
        let counters = ProgressCounters::new();
        counters.record(Outcome::Resolved);
        counters.record(Outcome::Error);
        counters.record(Outcome::Error);

        let snap = counters.snapshot(Instant::now());
        assert_eq!(snap.resolved, 1);
        assert_eq!(snap.unresolved, 0);
        assert_eq!(snap.errors, 2);
        assert_eq!(snap.completed(), 3);
    }

    #[test]
    fn test_gauge_guard_decrements() {
        let counters = ProgressCounters::new();
        {
            let _guard = ProgressCounters::enter(&counters.running);
            assert_eq!(counters.snapshot(Instant::now()).running, 1);
        }
        assert_eq!(counters.snapshot(Instant::now()).running, 0);
    }

    #[test]
    fn test_clone_shares_state() {
        let counters = ProgressCounters::new();
        let clone = counters.clone();
        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        assert_eq!(clone.dispatched.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_progress_monitor_start_stop() {
        let counters = ProgressCounters::new();
        counters.record(Outcome::Unresolved);

        let monitor = ProgressMonitor::start(counters, 10, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop().await;
    }
}
