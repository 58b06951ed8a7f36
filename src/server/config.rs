//! Server configuration.

use std::time::Duration;
use tracing::warn;

pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Knobs for a [`super::BackgroundJobServer`]; plain struct with defaults,
/// adjusted through the `with_*` builder methods.
#[derive(Debug, Clone)]
pub struct BackgroundJobServerConfiguration {
    /// Cadence of the coordination tick; also drives orphan detection, which
    /// fires at four times this interval. Minimum 5 seconds.
    pub poll_interval: Duration,
    /// Number of jobs this server executes concurrently.
    pub worker_pool_size: usize,
    /// Age after which SUCCEEDED jobs are moved to DELETED.
    pub delete_succeeded_jobs_after: Duration,
    /// Age after which DELETED jobs are physically removed.
    pub permanently_delete_deleted_jobs_after: Duration,
    /// Maximum FAILED entries before the retry filter gives up.
    pub max_retries: u32,
    /// Bounded grace period for running jobs during shutdown.
    pub stop_grace_period: Duration,
}

impl Default for BackgroundJobServerConfiguration {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            poll_interval: Duration::from_secs(15),
            worker_pool_size: parallelism * 8,
            delete_succeeded_jobs_after: Duration::from_secs(36 * 60 * 60),
            permanently_delete_deleted_jobs_after: Duration::from_secs(72 * 60 * 60),
            max_retries: 10,
            stop_grace_period: Duration::from_secs(10),
        }
    }
}

impl BackgroundJobServerConfiguration {
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        let requested = Duration::from_secs(seconds);
        self.poll_interval = if requested < MIN_POLL_INTERVAL {
            warn!(
                "poll interval of {seconds}s is below the {}s minimum; clamping",
                MIN_POLL_INTERVAL.as_secs()
            );
            MIN_POLL_INTERVAL
        } else {
            requested
        };
        self
    }

    pub fn with_worker_pool_size(mut self, worker_pool_size: usize) -> Self {
        self.worker_pool_size = worker_pool_size.max(1);
        self
    }

    pub fn with_delete_succeeded_jobs_after(mut self, after: Duration) -> Self {
        self.delete_succeeded_jobs_after = after;
        self
    }

    pub fn with_permanently_delete_deleted_jobs_after(mut self, after: Duration) -> Self {
        self.permanently_delete_deleted_jobs_after = after;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The window after which a PROCESSING job without heartbeats is orphaned
    /// and a silent server is dropped from the roster.
    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.poll_interval * 4)
            .expect("poll interval fits in a chrono duration")
    }

    pub fn poll_interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.poll_interval)
            .expect("poll interval fits in a chrono duration")
    }
}
