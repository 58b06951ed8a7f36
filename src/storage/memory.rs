//! In-memory storage provider.
//!
//! A single mutex over plain maps; the reference implementation of the
//! storage contract, used by tests and embedded single-process deployments.

use super::listeners::{ListenerRegistry, StorageChangeListener};
use super::rate_limit::RateLimiter;
use super::{
    BackgroundJobServerStatus, ConcurrentJobModification, JobStats, PageRequest, StorageError,
    StorageProvider, StorageResult,
};
use crate::jobs::{Job, JobDetails, RecurringJob, StateName};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct InMemoryState {
    jobs: HashMap<Uuid, Job>,
    recurring_jobs: BTreeMap<String, RecurringJob>,
    servers: HashMap<Uuid, BackgroundJobServerStatus>,
    counters: HashMap<String, u64>,
}

#[derive(Clone)]
pub struct InMemoryStorageProvider {
    state: Arc<Mutex<InMemoryState>>,
    registry: Arc<ListenerRegistry>,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self::with_change_notification_rate_limit(RateLimiter::per_second(5))
    }

    pub fn with_change_notification_rate_limit(rate_limiter: RateLimiter) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            registry: Arc::new(ListenerRegistry::new(rate_limiter)),
        }
    }

    fn page<'a, I>(jobs: I, page: PageRequest) -> Vec<Job>
    where
        I: Iterator<Item = &'a Job>,
    {
        jobs.skip(page.offset).take(page.limit).cloned().collect()
    }
}

impl Default for InMemoryStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageProvider for InMemoryStorageProvider {
    fn save_job(&self, job: Job) -> StorageResult<Job> {
        self.save_jobs(vec![job]).map(|mut jobs| jobs.remove(0))
    }

    fn save_jobs(&self, jobs: Vec<Job>) -> StorageResult<Vec<Job>> {
        let mut state = self.state.lock().unwrap();
        let conflicts: Vec<ConcurrentJobModification> = jobs
            .iter()
            .filter(|job| {
                let stored_version = state.jobs.get(&job.id()).map(Job::version).unwrap_or(0);
                stored_version != job.version()
            })
            .map(|job| ConcurrentJobModification {
                local: job.clone(),
                remote: state.jobs.get(&job.id()).cloned(),
            })
            .collect();
        if !conflicts.is_empty() {
            return Err(StorageError::ConcurrentModification(conflicts));
        }
        let mut saved = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.set_version(job.version() + 1);
            state.jobs.insert(job.id(), job.clone());
            saved.push(job);
        }
        Ok(saved)
    }

    fn get_job_by_id(&self, id: Uuid) -> StorageResult<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StorageError::JobNotFound(id))
    }

    fn get_jobs(&self, state: StateName, page: PageRequest) -> StorageResult<Vec<Job>> {
        let guard = self.state.lock().unwrap();
        let mut jobs: Vec<&Job> = guard
            .jobs
            .values()
            .filter(|j| j.state_name() == state)
            .collect();
        jobs.sort_by_key(|j| j.updated_at());
        Ok(Self::page(jobs.into_iter(), page))
    }

    fn get_jobs_updated_before(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Job>> {
        let guard = self.state.lock().unwrap();
        let mut jobs: Vec<&Job> = guard
            .jobs
            .values()
            .filter(|j| j.state_name() == state && j.updated_at() < updated_before)
            .collect();
        jobs.sort_by_key(|j| j.updated_at());
        Ok(Self::page(jobs.into_iter(), page))
    }

    fn get_scheduled_jobs(
        &self,
        scheduled_before: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Job>> {
        let guard = self.state.lock().unwrap();
        let mut jobs: Vec<&Job> = guard
            .jobs
            .values()
            .filter(|j| matches!(j.scheduled_at(), Some(at) if at < scheduled_before))
            .collect();
        jobs.sort_by_key(|j| j.scheduled_at());
        Ok(Self::page(jobs.into_iter(), page))
    }

    fn delete_jobs(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let mut guard = self.state.lock().unwrap();
        let before = guard.jobs.len();
        guard
            .jobs
            .retain(|_, j| !(j.state_name() == state && j.updated_at() < updated_before));
        Ok(before - guard.jobs.len())
    }

    fn exists(&self, details: &JobDetails, state: StateName) -> StorageResult<bool> {
        let signature = details.signature();
        let guard = self.state.lock().unwrap();
        Ok(guard
            .jobs
            .values()
            .any(|j| j.state_name() == state && j.signature() == signature))
    }

    fn count_jobs(&self, state: StateName) -> StorageResult<u64> {
        let guard = self.state.lock().unwrap();
        Ok(guard
            .jobs
            .values()
            .filter(|j| j.state_name() == state)
            .count() as u64)
    }

    fn get_job_stats(&self) -> StorageResult<JobStats> {
        let guard = self.state.lock().unwrap();
        let mut stats = JobStats::default();
        for job in guard.jobs.values() {
            match job.state_name() {
                StateName::Scheduled => stats.scheduled += 1,
                StateName::Enqueued => stats.enqueued += 1,
                StateName::Processing => stats.processing += 1,
                StateName::Succeeded => stats.succeeded += 1,
                StateName::Failed => stats.failed += 1,
                StateName::Deleted => stats.deleted += 1,
            }
        }
        let counter = guard
            .counters
            .get(StateName::Succeeded.as_str())
            .copied()
            .unwrap_or(0);
        stats.all_time_succeeded = counter + stats.succeeded;
        Ok(stats)
    }

    fn publish_job_stat_counter(&self, state: StateName, delta: u64) -> StorageResult<()> {
        let mut guard = self.state.lock().unwrap();
        *guard.counters.entry(state.as_str().to_string()).or_insert(0) += delta;
        Ok(())
    }

    fn get_recurring_jobs(&self) -> StorageResult<Vec<RecurringJob>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .recurring_jobs
            .values()
            .cloned()
            .collect())
    }

    fn save_recurring_job(&self, job: RecurringJob) -> StorageResult<RecurringJob> {
        self.state
            .lock()
            .unwrap()
            .recurring_jobs
            .insert(job.id().to_string(), job.clone());
        Ok(job)
    }

    fn delete_recurring_job(&self, id: &str) -> StorageResult<()> {
        self.state.lock().unwrap().recurring_jobs.remove(id);
        Ok(())
    }

    fn announce_background_job_server(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .servers
            .insert(status.id, status.clone());
        Ok(())
    }

    fn signal_background_job_server_alive(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> StorageResult<()> {
        let mut guard = self.state.lock().unwrap();
        match guard.servers.get_mut(&status.id) {
            Some(existing) => {
                existing.last_heartbeat = status.last_heartbeat;
                existing.is_running = status.is_running;
                existing.free_memory_bytes = status.free_memory_bytes;
                existing.system_cpu_load = status.system_cpu_load;
                existing.process_cpu_load = status.process_cpu_load;
            }
            // The server was removed as timed out; treat the signal as a
            // fresh announcement.
            None => {
                guard.servers.insert(status.id, status.clone());
            }
        }
        Ok(())
    }

    fn get_background_job_servers(&self) -> StorageResult<Vec<BackgroundJobServerStatus>> {
        let guard = self.state.lock().unwrap();
        let mut servers: Vec<BackgroundJobServerStatus> = guard.servers.values().cloned().collect();
        servers.sort_by_key(|s| (s.first_heartbeat, s.id));
        Ok(servers)
    }

    fn remove_timed_out_background_job_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let mut guard = self.state.lock().unwrap();
        let before = guard.servers.len();
        guard
            .servers
            .retain(|_, s| s.last_heartbeat >= heartbeat_older_than);
        Ok(before - guard.servers.len())
    }

    fn add_change_listener(&self, listener: StorageChangeListener) {
        ListenerRegistry::add(&self.registry, self, listener);
    }

    fn remove_change_listener(&self, listener: &StorageChangeListener) {
        self.registry.remove(listener);
    }

    fn close(&self) {
        self.registry.shutdown();
    }
}
