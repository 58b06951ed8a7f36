//! Job storage.
//!
//! The coordinator depends only on the [`StorageProvider`] contract; the
//! bundled backends are [`InMemoryStorageProvider`] and
//! [`SqliteStorageProvider`]. Every save is guarded by optimistic concurrency
//! on the job `version`: stale writes fail with
//! [`StorageError::ConcurrentModification`] instead of locking.

mod listeners;
mod memory;
mod rate_limit;
mod schema;
mod sqlite;

pub use listeners::{
    BackgroundJobServerStatusChangeListener, JobChangeListener, JobStatsChangeListener,
    ListenerRegistry, StorageChangeListener,
};
pub use memory::InMemoryStorageProvider;
pub use rate_limit::RateLimiter;
pub use sqlite::SqliteStorageProvider;

use crate::jobs::{Job, JobDetails, RecurringJob, StateName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Offset/limit window for page queries. Results are always ordered
/// ascending: by `updated_at` for state queries, by `scheduled_at` for
/// scheduled-job queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn asc(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

/// Counts per state plus the lifetime succeeded total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub scheduled: u64,
    pub enqueued: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deleted: u64,
    /// Jobs that ever succeeded: the persisted counter (bumped when succeeded
    /// jobs are cleaned up) plus the succeeded jobs still in storage.
    pub all_time_succeeded: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.scheduled + self.enqueued + self.processing + self.succeeded + self.failed
            + self.deleted
    }
}

/// Announced liveness and capacity of one server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundJobServerStatus {
    pub id: Uuid,
    pub worker_pool_size: usize,
    pub poll_interval_seconds: u32,
    pub first_heartbeat: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub is_running: bool,
    pub free_memory_bytes: u64,
    pub system_cpu_load: f64,
    pub process_cpu_load: f64,
}

/// A save that lost the optimistic-concurrency race: the local write and the
/// version another writer persisted in the meantime (`None` when the job was
/// physically removed).
#[derive(Debug, Clone)]
pub struct ConcurrentJobModification {
    pub local: Job,
    pub remote: Option<Job>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("{} job(s) were concurrently modified by another writer", .0.len())]
    ConcurrentModification(Vec<ConcurrentJobModification>),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The persistence contract the engine relies on.
///
/// All operations are synchronous; implementations must be safe to call from
/// multiple threads. Change-listener notifications are eventually consistent:
/// they are emitted by a background ticker, never synchronously with writes.
pub trait StorageProvider: Send + Sync {
    /// Persist one job. The stored version must equal `job.version()`; on
    /// success the returned job carries `version + 1`.
    fn save_job(&self, job: Job) -> StorageResult<Job>;

    /// Persist a batch atomically: either every job is written (each with its
    /// version incremented by one) or none is, and the error carries the
    /// conflicting (local, remote) pairs.
    fn save_jobs(&self, jobs: Vec<Job>) -> StorageResult<Vec<Job>>;

    fn get_job_by_id(&self, id: Uuid) -> StorageResult<Job>;

    /// Jobs currently in `state`, ordered by `updated_at` ascending.
    fn get_jobs(&self, state: StateName, page: PageRequest) -> StorageResult<Vec<Job>>;

    /// Jobs currently in `state` with `updated_at < updated_before`, ordered
    /// by `updated_at` ascending.
    fn get_jobs_updated_before(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Job>>;

    /// SCHEDULED jobs due before `scheduled_before`, ordered by
    /// `scheduled_at` ascending.
    fn get_scheduled_jobs(
        &self,
        scheduled_before: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Job>>;

    /// Physically remove jobs in `state` with `updated_at < updated_before`.
    fn delete_jobs(&self, state: StateName, updated_before: DateTime<Utc>)
        -> StorageResult<usize>;

    /// Whether any job with the same signature is currently in `state`.
    fn exists(&self, details: &JobDetails, state: StateName) -> StorageResult<bool>;

    fn count_jobs(&self, state: StateName) -> StorageResult<u64>;

    fn get_job_stats(&self) -> StorageResult<JobStats>;

    /// Add `delta` to the persisted lifetime counter for `state`.
    fn publish_job_stat_counter(&self, state: StateName, delta: u64) -> StorageResult<()>;

    fn get_recurring_jobs(&self) -> StorageResult<Vec<RecurringJob>>;
    fn save_recurring_job(&self, job: RecurringJob) -> StorageResult<RecurringJob>;
    fn delete_recurring_job(&self, id: &str) -> StorageResult<()>;

    fn announce_background_job_server(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> StorageResult<()>;
    fn signal_background_job_server_alive(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> StorageResult<()>;
    /// All announced servers, ordered by `first_heartbeat` ascending.
    fn get_background_job_servers(&self) -> StorageResult<Vec<BackgroundJobServerStatus>>;
    fn remove_timed_out_background_job_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> StorageResult<usize>;

    fn add_change_listener(&self, listener: StorageChangeListener);
    fn remove_change_listener(&self, listener: &StorageChangeListener);

    /// Release background resources (stops the change-notification ticker).
    fn close(&self);
}
