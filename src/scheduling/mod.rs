//! The client-facing scheduling API.
//!
//! [`JobScheduler`] is a thin facade over the storage provider: it persists
//! new jobs in their initial state and leaves everything else to the server
//! fleet.

pub mod registry;

pub use registry::{DispatchError, JobHandler, JobHandlerRegistry, JobRunContext};

use crate::clock::{Clock, SystemClock};
use crate::cron::CronParseError;
use crate::jobs::{Job, JobDetails, JobParameter, RecurringJob, DEFAULT_METHOD};
use crate::storage::{StorageError, StorageProvider};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error(transparent)]
    Cron(#[from] CronParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A unit of work to submit: the registered handler type plus captured
/// argument values.
#[derive(Debug, Clone)]
pub struct JobRequest {
    class_name: String,
    method_name: String,
    params: Vec<JobParameter>,
}

impl JobRequest {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: DEFAULT_METHOD.to_string(),
            params: Vec::new(),
        }
    }

    pub fn with_method(mut self, method_name: impl Into<String>) -> Self {
        self.method_name = method_name.into();
        self
    }

    /// Capture an argument value; it is serialized into the job descriptor
    /// and handed back to the handler at execution time.
    pub fn with_arg<T: Serialize>(mut self, value: T) -> Self {
        let value = serde_json::to_value(value).expect("job arguments must serialize to JSON");
        self.params
            .push(JobParameter::new(std::any::type_name::<T>(), value));
        self
    }

    fn to_details(&self) -> JobDetails {
        JobDetails::new(
            self.class_name.clone(),
            self.method_name.clone(),
            self.params.clone(),
        )
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    storage: Arc<dyn StorageProvider>,
    clock: Arc<dyn Clock>,
}

impl JobScheduler {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn StorageProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Submit a job for immediate execution. Returns the job id.
    pub fn enqueue(&self, request: JobRequest) -> Result<Uuid, SchedulingError> {
        let job = Job::enqueued(request.to_details(), self.clock.now());
        let saved = self.storage.save_job(job)?;
        debug!(job_id = %saved.id(), "enqueued job");
        Ok(saved.id())
    }

    /// Submit a job to run at `at`. Returns the job id.
    pub fn schedule(
        &self,
        at: DateTime<Utc>,
        request: JobRequest,
    ) -> Result<Uuid, SchedulingError> {
        let job = Job::scheduled(request.to_details(), at, None, self.clock.now());
        let saved = self.storage.save_job(job)?;
        debug!(job_id = %saved.id(), scheduled_at = %at, "scheduled job");
        Ok(saved.id())
    }

    /// Register a recurring job. `id` may be `None` to derive one from the
    /// job signature; re-registering the same id replaces the definition.
    pub fn schedule_recurringly(
        &self,
        id: Option<&str>,
        request: JobRequest,
        cron_expression: &str,
        zone_id: &str,
    ) -> Result<String, SchedulingError> {
        let recurring = RecurringJob::new(
            id.map(String::from),
            request.to_details(),
            cron_expression,
            zone_id,
        )?;
        let saved = self.storage.save_recurring_job(recurring)?;
        debug!(recurring_job_id = %saved.id(), cron = cron_expression, "registered recurring job");
        Ok(saved.id().to_string())
    }

    /// Request deletion of a job. Running jobs are cancelled cooperatively:
    /// the owning server observes the DELETED state on its next heartbeat
    /// save and stops the worker.
    pub fn delete(&self, job_id: Uuid) -> Result<(), SchedulingError> {
        // Deleting always wins from our side; retry over concurrent writers.
        for _ in 0..3 {
            let mut job = self.storage.get_job_by_id(job_id)?;
            job.delete("Deleted via the scheduling API", self.clock.now());
            match self.storage.save_job(job) {
                Ok(_) => return Ok(()),
                Err(StorageError::ConcurrentModification(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut job = self.storage.get_job_by_id(job_id)?;
        job.delete("Deleted via the scheduling API", self.clock.now());
        self.storage.save_job(job).map(|_| ()).map_err(Into::into)
    }

    /// Remove a recurring job definition. Already materialized occurrences
    /// are purged by the master on its next tick.
    pub fn delete_recurring_job(&self, id: &str) -> Result<(), SchedulingError> {
        self.storage.delete_recurring_job(id)?;
        Ok(())
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Job, SchedulingError> {
        self.storage.get_job_by_id(job_id).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::StateName;
    use crate::storage::InMemoryStorageProvider;
    use chrono::Duration;

    fn scheduler() -> (JobScheduler, Arc<InMemoryStorageProvider>) {
        let storage = Arc::new(InMemoryStorageProvider::new());
        (JobScheduler::new(storage.clone()), storage)
    }

    #[test]
    fn enqueue_persists_an_enqueued_job() {
        let (scheduler, storage) = scheduler();
        let id = scheduler
            .enqueue(JobRequest::new("tests.SendMail").with_arg("user@example.com"))
            .unwrap();

        let job = storage.get_job_by_id(id).unwrap();
        assert_eq!(job.state_name(), StateName::Enqueued);
        assert_eq!(job.version(), 1);
        assert_eq!(job.details().params[0].value, "user@example.com");
    }

    #[test]
    fn schedule_persists_a_scheduled_job() {
        let (scheduler, storage) = scheduler();
        let at = Utc::now() + Duration::minutes(30);
        let id = scheduler.schedule(at, JobRequest::new("tests.Later")).unwrap();

        let job = storage.get_job_by_id(id).unwrap();
        assert_eq!(job.state_name(), StateName::Scheduled);
        assert_eq!(job.scheduled_at(), Some(at));
    }

    #[test]
    fn recurring_registration_validates_cron() {
        let (scheduler, storage) = scheduler();
        let id = scheduler
            .schedule_recurringly(Some("nightly"), JobRequest::new("tests.Nightly"), "0 3 * * *", "UTC")
            .unwrap();
        assert_eq!(id, "nightly");
        assert_eq!(storage.get_recurring_jobs().unwrap().len(), 1);

        let err = scheduler.schedule_recurringly(
            None,
            JobRequest::new("tests.Broken"),
            "nope",
            "UTC",
        );
        assert!(matches!(err, Err(SchedulingError::Cron(_))));
    }

    #[test]
    fn delete_appends_a_deleted_state() {
        let (scheduler, storage) = scheduler();
        let id = scheduler.enqueue(JobRequest::new("tests.Abort")).unwrap();
        scheduler.delete(id).unwrap();

        let job = storage.get_job_by_id(id).unwrap();
        assert_eq!(
            job.state_names(),
            vec![StateName::Enqueued, StateName::Deleted]
        );
    }

    #[test]
    fn delete_retries_over_concurrent_writers() {
        let (scheduler, storage) = scheduler();
        let id = scheduler.enqueue(JobRequest::new("tests.Abort")).unwrap();

        // A server acquires the job between our read and write; delete still
        // lands because it re-reads and retries.
        let mut acquired = storage.get_job_by_id(id).unwrap();
        acquired.start_processing(Uuid::new_v4(), Utc::now()).unwrap();
        storage.save_job(acquired).unwrap();

        scheduler.delete(id).unwrap();
        assert_eq!(
            storage.get_job_by_id(id).unwrap().state_name(),
            StateName::Deleted
        );
    }
}
