//! jobmill: distributed background job processing.
//!
//! Application code submits units of work (one-shot, scheduled for a future
//! instant, or recurring on a cron expression) through the [`scheduling::JobScheduler`]
//! facade. One or more [`server::BackgroundJobServer`] instances share a
//! [`storage::StorageProvider`] backend, elect a master among themselves, pull
//! enqueued work into a bounded local worker pool, retry failures with
//! exponential backoff, and retain job history for inspection.
//!
//! Delivery is at-least-once: state transitions are guarded by optimistic
//! concurrency on the job `version`, so two servers racing for the same job
//! resolve to a single owner.

pub mod clock;
pub mod cron;
pub mod jobs;
pub mod scheduling;
pub mod server;
pub mod storage;

pub use clock::{Clock, SystemClock};
pub use cron::CronExpression;
pub use jobs::{Job, JobDetails, JobState, RecurringJob, StateName};
pub use scheduling::{JobHandler, JobHandlerRegistry, JobRequest, JobRunContext, JobScheduler};
pub use server::{BackgroundJobServer, BackgroundJobServerConfiguration};
pub use storage::{
    InMemoryStorageProvider, PageRequest, SqliteStorageProvider, StorageError, StorageProvider,
};
