//! Run counters and summary reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Images written to the batch directory
    pub images_fetched: AtomicU64,

    /// Images skipped because the fetch failed
    pub images_rejected: AtomicU64,

    /// Total bytes fetched from the remote store
    pub bytes_fetched: AtomicU64,

    /// Batches handed to the execution backend
    pub batches_dispatched: AtomicU64,

    /// Tasks the backend reported as succeeded
    pub tasks_succeeded: AtomicU64,

    /// Tasks that failed or never ran
    pub tasks_failed: AtomicU64,

    /// Configuration files written
    pub configs_written: AtomicU64,

    /// Images whose configuration could not be derived
    pub config_failures: AtomicU64,

    /// Time spent waiting on the execution backend (microseconds)
    pub execute_us: AtomicU64,

    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a fetched image.
    pub fn add_image_fetched(&self, bytes: u64) {
        self.images_fetched.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a rejected image.
    pub fn add_image_rejected(&self) {
        self.images_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_batch_dispatched(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_succeeded(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_config_written(&self) {
        self.configs_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_config_failure(&self) {
        self.config_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in the execution backend.
    pub fn add_execute_time(&self, duration: Duration) {
        self.execute_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            images_fetched: self.images_fetched.load(Ordering::Relaxed),
            images_rejected: self.images_rejected.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            configs_written: self.configs_written.load(Ordering::Relaxed),
            config_failures: self.config_failures.load(Ordering::Relaxed),
            execute_secs: self.execute_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            elapsed: self.elapsed(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub images_fetched: u64,
    pub images_rejected: u64,
    pub bytes_fetched: u64,
    pub batches_dispatched: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub configs_written: u64,
    pub config_failures: u64,
    /// Wall time spent waiting on the execution backend
    pub execute_secs: f64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Images: {} fetched, {} rejected ({:.1} MB) | Batches: {} | \
             Tasks: {} succeeded, {} failed | Configs: {} written, {} failed | \
             Solver: {:.1}s | Elapsed: {:.1}s",
            self.images_fetched,
            self.images_rejected,
            self.bytes_fetched as f64 / (1024.0 * 1024.0),
            self.batches_dispatched,
            self.tasks_succeeded,
            self.tasks_failed,
            self.configs_written,
            self.config_failures,
            self.execute_secs,
            self.elapsed.as_secs_f64(),
        )
    }
}
