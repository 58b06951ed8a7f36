//! Bookkeeping for jobs currently executing on this server.
//!
//! Worker tasks add and remove entries, the coordinator iterates them for
//! heartbeats, and the conflict resolver cancels them when a job is deleted
//! remotely. Iteration always works on a snapshot so concurrent add/remove
//! is safe.

use crate::jobs::Job;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One running job: the server-local copy of the aggregate (kept current
/// across heartbeat saves) plus its cooperative cancellation token.
pub(crate) struct ProcessingHandle {
    job: Mutex<Job>,
    cancel: CancellationToken,
}

impl ProcessingHandle {
    fn new(job: Job) -> Self {
        Self {
            job: Mutex::new(job),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job(&self) -> Job {
        self.job.lock().unwrap().clone()
    }

    pub fn set_job(&self, job: Job) {
        *self.job.lock().unwrap() = job;
    }

    /// Refresh the heartbeat timestamp and return a copy for saving; `None`
    /// when the job is no longer in PROCESSING.
    pub fn heartbeat(&self, now: chrono::DateTime<chrono::Utc>) -> Option<Job> {
        let mut job = self.job.lock().unwrap();
        job.update_processing(now).ok()?;
        Some(job.clone())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Default)]
pub(crate) struct ProcessingRegistry {
    handles: Mutex<HashMap<Uuid, Arc<ProcessingHandle>>>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Arc<ProcessingHandle> {
        let handle = Arc::new(ProcessingHandle::new(job.clone()));
        self.handles.lock().unwrap().insert(job.id(), handle.clone());
        handle
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<ProcessingHandle>> {
        self.handles.lock().unwrap().remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ProcessingHandle>> {
        self.handles.lock().unwrap().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ProcessingHandle>> {
        self.handles.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn cancel_all(&self) {
        for handle in self.snapshot() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobDetails, DEFAULT_METHOD};
    use chrono::{Duration, Utc};

    fn processing_job() -> Job {
        let now = Utc::now();
        let mut job = Job::enqueued(JobDetails::new("tests.Work", DEFAULT_METHOD, vec![]), now);
        job.start_processing(Uuid::new_v4(), now).unwrap();
        job
    }

    #[test]
    fn insert_and_remove_track_the_queue_size() {
        let registry = ProcessingRegistry::new();
        let job = processing_job();
        let id = job.id();

        registry.insert(job);
        assert_eq!(registry.len(), 1);

        registry.remove(id);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn heartbeat_advances_the_handles_copy() {
        let registry = ProcessingRegistry::new();
        let job = processing_job();
        let was = job.updated_at();
        let handle = registry.insert(job);

        let later = was + Duration::seconds(30);
        let beat = handle.heartbeat(later).unwrap();
        assert_eq!(beat.updated_at(), later);
        assert_eq!(handle.job().updated_at(), later);
    }

    #[test]
    fn heartbeat_stops_once_the_job_left_processing() {
        let registry = ProcessingRegistry::new();
        let mut job = processing_job();
        job.succeed(Utc::now()).unwrap();
        let handle = registry.insert(job);
        assert!(handle.heartbeat(Utc::now()).is_none());
    }
}
