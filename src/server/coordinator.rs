//! The coordination loop.
//!
//! Every server runs one coordinator at a fixed poll interval; one invocation
//! is a tick, and at most one tick per server is in flight. The elected
//! master additionally advances the cluster-wide state machines: recurring
//! jobs, due scheduled jobs, orphans and retention. All servers heartbeat
//! their own running jobs and pull enqueued work into the local pool.

use super::concurrent::ConcurrentJobModificationResolver;
use super::strategy::{BasicWorkDistributionStrategy, WorkDistributionStrategy};
use super::ServerContext;
use crate::jobs::{Job, StateName};
use crate::scheduling::registry::JobRunContext;
use crate::storage::{PageRequest, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PAGE_SIZE: usize = 1000;
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

pub(crate) struct JobCoordinator {
    ctx: Arc<ServerContext>,
    strategy: Box<dyn WorkDistributionStrategy>,
    resolver: ConcurrentJobModificationResolver,
    is_master: AtomicBool,
    consecutive_failures: AtomicU32,
    tick_lock: Mutex<()>,
    pull_lock: Mutex<()>,
    self_weak: Weak<JobCoordinator>,
}

impl JobCoordinator {
    pub fn new(ctx: Arc<ServerContext>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            strategy: Box::new(BasicWorkDistributionStrategy::new(
                ctx.config.worker_pool_size,
                ctx.processing.clone(),
            )),
            resolver: ConcurrentJobModificationResolver::new(
                ctx.storage.clone(),
                ctx.processing.clone(),
            ),
            ctx,
            is_master: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            tick_lock: Mutex::new(()),
            pull_lock: Mutex::new(()),
            self_weak: weak.clone(),
        })
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub fn set_is_master(&self, is_master: bool) {
        let was = self.is_master.swap(is_master, Ordering::SeqCst);
        if was != is_master {
            if is_master {
                info!(server_id = %self.ctx.id, "this server is now the master");
            } else {
                info!(server_id = %self.ctx.id, "this server is no longer the master");
            }
        }
    }

    /// One tick. Skipped when the previous tick is still running or the
    /// server has not been started yet.
    pub fn run_tick(&self) {
        let Ok(_tick) = self.tick_lock.try_lock() else {
            debug!("previous tick still in flight; skipping");
            return;
        };
        if !self.ctx.running.load(Ordering::SeqCst) {
            return;
        }
        match self.tick() {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(StorageError::Unavailable(msg)) => {
                warn!("storage unavailable, pausing until the next tick: {msg}");
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures <= MAX_CONSECUTIVE_FAILURES {
                    warn!("coordination tick failed ({failures}/{MAX_CONSECUTIVE_FAILURES}), processing continues: {e}");
                } else {
                    error!("too many consecutive coordination failures; shutting the server down: {e}");
                    self.ctx.initiate_shutdown();
                }
            }
        }
    }

    fn tick(&self) -> StorageResult<()> {
        if self.can_onboard_new_work() {
            if self.is_master() {
                self.run_master_tasks()?;
            }
            self.update_jobs_that_are_being_processed()?;
            self.check_for_enqueued_jobs()?;
        } else {
            self.update_jobs_that_are_being_processed()?;
        }
        Ok(())
    }

    fn can_onboard_new_work(&self) -> bool {
        self.ctx.running.load(Ordering::SeqCst) && self.strategy.can_onboard_new_work()
    }

    fn run_master_tasks(&self) -> StorageResult<()> {
        self.check_for_recurring_jobs()?;
        self.check_for_scheduled_jobs()?;
        self.check_for_orphaned_jobs()?;
        self.check_for_succeeded_jobs_ready_for_retention()?;
        self.check_for_deleted_jobs_ready_for_removal()?;
        self.check_for_occurrences_of_deleted_recurring_jobs()?;
        Ok(())
    }

    /// Materialize one SCHEDULED occurrence per recurring job that has no
    /// live occurrence yet.
    fn check_for_recurring_jobs(&self) -> StorageResult<()> {
        debug!("looking for recurring jobs");
        let recurring_jobs = self.ctx.storage.get_recurring_jobs()?;
        let now = self.ctx.clock.now();
        let mut occurrences = Vec::new();
        for recurring in &recurring_jobs {
            if self.has_live_occurrence(recurring.details())? {
                continue;
            }
            match recurring.next_occurrence(now) {
                Some(at) => occurrences.push(recurring.materialize(at, now)),
                None => warn!(
                    recurring_job_id = %recurring.id(),
                    "recurring job has no next occurrence"
                ),
            }
        }
        if occurrences.is_empty() {
            return Ok(());
        }
        debug!("materializing {} recurring job occurrence(s)", occurrences.len());
        self.save_with_filters(occurrences)
    }

    fn has_live_occurrence(&self, details: &crate::jobs::JobDetails) -> StorageResult<bool> {
        for state in [
            StateName::Scheduled,
            StateName::Enqueued,
            StateName::Processing,
        ] {
            if self.ctx.storage.exists(details, state)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Enqueue scheduled jobs due within the next poll interval, slightly
    /// early so they are ENQUEUED by their scheduled instant.
    fn check_for_scheduled_jobs(&self) -> StorageResult<()> {
        debug!("looking for scheduled jobs");
        let until = self.ctx.clock.now() + self.ctx.config.poll_interval_chrono();
        let storage = self.ctx.storage.clone();
        self.process_job_pages(
            move || storage.get_scheduled_jobs(until, PageRequest::asc(0, PAGE_SIZE)),
            |job, now| job.enqueue(now).is_ok(),
        )?;
        Ok(())
    }

    /// Fail PROCESSING jobs whose owner stopped heartbeating; the retry
    /// filter decides whether they get another chance.
    fn check_for_orphaned_jobs(&self) -> StorageResult<()> {
        debug!("looking for orphaned jobs");
        let updated_before = self.ctx.clock.now() - self.ctx.config.liveness_timeout();
        let storage = self.ctx.storage.clone();
        self.process_job_pages(
            move || {
                storage.get_jobs_updated_before(
                    StateName::Processing,
                    updated_before,
                    PageRequest::asc(0, PAGE_SIZE),
                )
            },
            |job, now| {
                job.fail(
                    "IllegalJobState",
                    "Orphaned job",
                    "Job was too long in PROCESSING state without being updated",
                    now,
                )
                .is_ok()
            },
        )?;
        Ok(())
    }

    fn check_for_succeeded_jobs_ready_for_retention(&self) -> StorageResult<()> {
        debug!("looking for succeeded jobs ready for deletion");
        let retention = chrono::Duration::from_std(self.ctx.config.delete_succeeded_jobs_after)
            .unwrap_or_else(|_| chrono::Duration::hours(36));
        let updated_before = self.ctx.clock.now() - retention;
        let storage = self.ctx.storage.clone();
        let deleted = self.process_job_pages(
            move || {
                storage.get_jobs_updated_before(
                    StateName::Succeeded,
                    updated_before,
                    PageRequest::asc(0, PAGE_SIZE),
                )
            },
            |job, now| {
                job.delete("Succeeded job exceeded its retention period", now);
                true
            },
        )?;
        if deleted > 0 {
            self.ctx
                .storage
                .publish_job_stat_counter(StateName::Succeeded, deleted as u64)?;
        }
        Ok(())
    }

    fn check_for_deleted_jobs_ready_for_removal(&self) -> StorageResult<()> {
        debug!("looking for deleted jobs ready for permanent removal");
        let retention =
            chrono::Duration::from_std(self.ctx.config.permanently_delete_deleted_jobs_after)
                .unwrap_or_else(|_| chrono::Duration::hours(72));
        let updated_before = self.ctx.clock.now() - retention;
        let removed = self
            .ctx
            .storage
            .delete_jobs(StateName::Deleted, updated_before)?;
        if removed > 0 {
            info!("permanently removed {removed} deleted job(s)");
        }
        Ok(())
    }

    /// Delete SCHEDULED occurrences whose recurring job definition is gone.
    fn check_for_occurrences_of_deleted_recurring_jobs(&self) -> StorageResult<()> {
        let live: HashSet<String> = self
            .ctx
            .storage
            .get_recurring_jobs()?
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        let mut stale = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .ctx
                .storage
                .get_jobs(StateName::Scheduled, PageRequest::asc(offset, PAGE_SIZE))?;
            let page_len = page.len();
            stale.extend(page.into_iter().filter(|job| {
                job.recurring_job_id()
                    .is_some_and(|id| !live.contains(id))
            }));
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        if stale.is_empty() {
            return Ok(());
        }
        let now = self.ctx.clock.now();
        for job in &mut stale {
            job.delete("Recurring job was deleted", now);
        }
        debug!("purging {} occurrence(s) of deleted recurring jobs", stale.len());
        self.save_with_filters(stale)
    }

    /// Heartbeat every job this server is currently processing.
    fn update_jobs_that_are_being_processed(&self) -> StorageResult<()> {
        let handles = self.ctx.processing.snapshot();
        if handles.is_empty() {
            return Ok(());
        }
        debug!("updating {} currently processed job(s)", handles.len());
        let now = self.ctx.clock.now();
        let jobs: Vec<Job> = handles
            .iter()
            .filter_map(|handle| handle.heartbeat(now))
            .collect();
        if jobs.is_empty() {
            return Ok(());
        }
        self.save_internal(jobs, true)
    }

    /// Pull enqueued work into the local pool. Guarded by a try-lock so the
    /// idle-worker callback cannot re-enter a pull already in progress.
    fn check_for_enqueued_jobs(&self) -> StorageResult<()> {
        let Ok(_pull) = self.pull_lock.try_lock() else {
            return Ok(());
        };
        let page = self.strategy.work_page_request();
        if page.limit == 0 {
            return Ok(());
        }
        debug!("looking for enqueued jobs (limit {})", page.limit);
        let jobs = self.ctx.storage.get_jobs(StateName::Enqueued, page)?;
        for job in jobs {
            self.onboard_job(job);
        }
        Ok(())
    }

    /// Called by a worker that just finished a job; opportunistically pulls
    /// more work without waiting for the next tick.
    pub fn notify_thread_idle(&self) {
        if !self.ctx.running.load(Ordering::SeqCst) {
            return;
        }
        if self.strategy.can_onboard_new_work() {
            if let Err(e) = self.check_for_enqueued_jobs() {
                debug!("idle-worker pull failed: {e}");
            }
        }
    }

    /// Acquire one enqueued job and hand it to the worker pool. The
    /// PROCESSING save is the moment of acquisition: when two servers race,
    /// the version check lets exactly one win and the loser discards.
    fn onboard_job(&self, mut job: Job) {
        let Ok(permit) = Arc::clone(&self.ctx.worker_permits).try_acquire_owned() else {
            return;
        };
        let now = self.ctx.clock.now();
        if job.start_processing(self.ctx.id, now).is_err() {
            return;
        }
        let mut batch = vec![job];
        self.ctx.filters.run_on_state_election(&mut batch, now);
        let job = batch.remove(0);
        let saved = match self.ctx.storage.save_job(job) {
            Ok(saved) => saved,
            Err(StorageError::ConcurrentModification(_)) => {
                debug!("another server acquired the job first");
                return;
            }
            Err(e) => {
                warn!("could not acquire enqueued job: {e}");
                return;
            }
        };
        self.ctx
            .filters
            .run_on_state_applied(std::slice::from_ref(&saved), now);
        let handle = self.ctx.processing.insert(saved.clone());
        self.spawn_worker(saved, handle, permit);
    }

    fn spawn_worker(
        &self,
        job: Job,
        handle: Arc<super::worker::ProcessingHandle>,
        permit: OwnedSemaphorePermit,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let coordinator = self.self_weak.clone();
        tokio::spawn(async move {
            let job_id = job.id();
            let started = Instant::now();
            let run_ctx = JobRunContext::new(
                job_id,
                job.details().method_name.clone(),
                job.details().params.clone(),
                handle.cancellation_token(),
            );
            let outcome = match ctx.handlers.resolve(job.details()) {
                Ok(handler) => {
                    match tokio::task::spawn_blocking(move || handler.run(&run_ctx)).await {
                        Ok(result) => JobOutcome::Ran(result),
                        Err(join_error) => JobOutcome::Ran(Err(anyhow::anyhow!(
                            "job execution panicked: {join_error}"
                        ))),
                    }
                }
                Err(dispatch_error) => JobOutcome::Unresolvable(dispatch_error),
            };
            debug!(%job_id, elapsed = ?started.elapsed(), "job execution finished");

            if handle.is_cancelled() {
                // Deleted while running; the DELETED state is already
                // persisted, our local outcome is discarded.
                ctx.processing.remove(job_id);
            } else {
                let now = ctx.clock.now();
                let mut current = handle.job();
                let transition = match &outcome {
                    JobOutcome::Ran(Ok(())) => current.succeed(now).map_err(|e| e.to_string()),
                    JobOutcome::Ran(Err(error)) => current
                        .fail("JobExecutionError", error.to_string(), format!("{error:?}"), now)
                        .map_err(|e| e.to_string()),
                    JobOutcome::Unresolvable(dispatch_error) => current
                        .fail(
                            dispatch_error.kind(),
                            dispatch_error.to_string(),
                            String::new(),
                            now,
                        )
                        .map_err(|e| e.to_string()),
                };
                match transition {
                    Ok(()) => {
                        if let Some(coordinator) = coordinator.upgrade() {
                            if let Err(e) = coordinator.save_with_filters(vec![current]) {
                                warn!(%job_id, "could not persist job outcome: {e}");
                            }
                        }
                    }
                    Err(e) => warn!(%job_id, "job finished in an unexpected state: {e}"),
                }
                ctx.processing.remove(job_id);
            }

            drop(permit);
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.notify_thread_idle();
            }
        });
    }

    /// The page-through-until-empty idiom shared by all bulk advances. The
    /// mutator returns `false` to skip a job; when a whole page is skipped
    /// the sweep stops to guarantee termination.
    fn process_job_pages<S, M>(&self, supplier: S, mut mutate: M) -> StorageResult<usize>
    where
        S: Fn() -> StorageResult<Vec<Job>>,
        M: FnMut(&mut Job, DateTime<Utc>) -> bool,
    {
        let mut total = 0;
        loop {
            let mut jobs = supplier()?;
            if jobs.is_empty() {
                return Ok(total);
            }
            let now = self.ctx.clock.now();
            jobs.retain_mut(|job| mutate(job, now));
            if jobs.is_empty() {
                return Ok(total);
            }
            total += jobs.len();
            self.save_with_filters(jobs)?;
        }
    }

    fn save_with_filters(&self, jobs: Vec<Job>) -> StorageResult<()> {
        self.save_internal(jobs, false)
    }

    /// Run the election filters, save, run the applied filters; conflicts go
    /// to the resolver and the conflict-free subset is retried once.
    fn save_internal(&self, mut jobs: Vec<Job>, write_back: bool) -> StorageResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.filters.run_on_state_election(&mut jobs, now);
        match self.ctx.storage.save_jobs(jobs.clone()) {
            Ok(saved) => {
                self.finish_save(&saved, write_back, now);
                Ok(())
            }
            Err(StorageError::ConcurrentModification(conflicts)) => {
                let conflicted: HashSet<Uuid> =
                    conflicts.iter().map(|c| c.local.id()).collect();
                self.resolver.resolve(conflicts, now)?;
                let rest: Vec<Job> = jobs
                    .into_iter()
                    .filter(|job| !conflicted.contains(&job.id()))
                    .collect();
                if rest.is_empty() {
                    return Ok(());
                }
                match self.ctx.storage.save_jobs(rest) {
                    Ok(saved) => {
                        self.finish_save(&saved, write_back, now);
                        Ok(())
                    }
                    Err(StorageError::ConcurrentModification(more)) => {
                        self.resolver.resolve(more, now)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn finish_save(&self, saved: &[Job], write_back: bool, now: DateTime<Utc>) {
        if write_back {
            for job in saved {
                if let Some(handle) = self.ctx.processing.get(job.id()) {
                    handle.set_job(job.clone());
                }
            }
        }
        self.ctx.filters.run_on_state_applied(saved, now);
    }
}

enum JobOutcome {
    Ran(anyhow::Result<()>),
    Unresolvable(crate::scheduling::registry::DispatchError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::jobs::{JobDetails, JobFilters, RecurringJob, DEFAULT_METHOD};
    use crate::scheduling::JobHandlerRegistry;
    use crate::storage::{InMemoryStorageProvider, StorageProvider};
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        storage: Arc<InMemoryStorageProvider>,
        clock: Arc<ManualClock>,
        coordinator: Arc<JobCoordinator>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorageProvider::new());
        let clock = Arc::new(ManualClock::starting_at(Utc::now()));
        let config = crate::server::BackgroundJobServerConfiguration::default()
            .with_poll_interval_seconds(5)
            .with_worker_pool_size(2);
        let ctx = Arc::new(super::super::ServerContext {
            id: Uuid::new_v4(),
            worker_permits: Arc::new(Semaphore::new(config.worker_pool_size)),
            filters: JobFilters::with_default_filters(config.max_retries),
            config,
            storage: storage.clone(),
            clock: clock.clone(),
            handlers: Arc::new(JobHandlerRegistry::new()),
            processing: Arc::new(super::super::worker::ProcessingRegistry::new()),
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });
        let coordinator = JobCoordinator::new(ctx);
        coordinator.set_is_master(true);
        Fixture {
            storage,
            clock,
            coordinator,
        }
    }

    fn details(class: &str) -> JobDetails {
        JobDetails::new(class, DEFAULT_METHOD, vec![])
    }

    #[test]
    fn due_scheduled_jobs_are_enqueued_slightly_early() {
        let fx = fixture();
        let now = fx.clock.now();

        let due_in_4s = fx
            .storage
            .save_job(Job::scheduled(
                details("t.Soon"),
                now + chrono::Duration::seconds(4),
                None,
                now,
            ))
            .unwrap();
        let due_in_9s = fx
            .storage
            .save_job(Job::scheduled(
                details("t.Late"),
                now + chrono::Duration::seconds(9),
                None,
                now,
            ))
            .unwrap();

        fx.coordinator.check_for_scheduled_jobs().unwrap();

        // Within now + pollInterval: enqueued. Beyond it: untouched.
        assert_eq!(
            fx.storage.get_job_by_id(due_in_4s.id()).unwrap().state_name(),
            StateName::Enqueued
        );
        assert_eq!(
            fx.storage.get_job_by_id(due_in_9s.id()).unwrap().state_name(),
            StateName::Scheduled
        );
    }

    #[test]
    fn orphan_detection_honors_the_four_poll_interval_window() {
        let fx = fixture();
        let now = fx.clock.now();
        let dead_server = Uuid::new_v4();

        let make_processing = |age: chrono::Duration| {
            let at = now - age;
            let mut job = Job::enqueued(details("t.Work"), at);
            job.start_processing(dead_server, at).unwrap();
            fx.storage.save_job(job).unwrap()
        };
        let stale = make_processing(chrono::Duration::seconds(25));
        let fresh = make_processing(chrono::Duration::seconds(15));

        fx.coordinator.check_for_orphaned_jobs().unwrap();

        let orphaned = fx.storage.get_job_by_id(stale.id()).unwrap();
        assert_eq!(
            orphaned.state_names()[..4],
            [
                StateName::Enqueued,
                StateName::Processing,
                StateName::Failed,
                StateName::Scheduled
            ]
        );
        assert_eq!(
            fx.storage.get_job_by_id(fresh.id()).unwrap().state_name(),
            StateName::Processing
        );
    }

    #[test]
    fn recurring_jobs_materialize_exactly_one_live_occurrence() {
        let fx = fixture();
        let recurring =
            RecurringJob::new(Some("tick".into()), details("t.Cron"), "* * * * *", "UTC").unwrap();
        fx.storage.save_recurring_job(recurring).unwrap();

        fx.coordinator.check_for_recurring_jobs().unwrap();
        assert_eq!(fx.storage.count_jobs(StateName::Scheduled).unwrap(), 1);

        // A second pass sees the live occurrence and does nothing.
        fx.coordinator.check_for_recurring_jobs().unwrap();
        assert_eq!(fx.storage.count_jobs(StateName::Scheduled).unwrap(), 1);

        let occurrence = fx
            .storage
            .get_scheduled_jobs(
                fx.clock.now() + chrono::Duration::minutes(2),
                PageRequest::asc(0, 10),
            )
            .unwrap()
            .remove(0);
        assert_eq!(occurrence.recurring_job_id(), Some("tick"));
    }

    #[test]
    fn succeeded_jobs_move_to_deleted_only_after_the_retention_window() {
        let fx = fixture();
        let now = fx.clock.now();
        let server = Uuid::new_v4();

        let make_succeeded = |age: chrono::Duration| {
            let at = now - age;
            let mut job = Job::enqueued(details("t.Done"), at);
            job.start_processing(server, at).unwrap();
            job.succeed(at).unwrap();
            fx.storage.save_job(job).unwrap()
        };
        let old = make_succeeded(chrono::Duration::hours(37));
        let young = make_succeeded(chrono::Duration::hours(35) + chrono::Duration::minutes(59));

        fx.coordinator
            .check_for_succeeded_jobs_ready_for_retention()
            .unwrap();

        assert_eq!(
            fx.storage.get_job_by_id(old.id()).unwrap().state_name(),
            StateName::Deleted
        );
        assert_eq!(
            fx.storage.get_job_by_id(young.id()).unwrap().state_name(),
            StateName::Succeeded
        );
        assert_eq!(fx.storage.get_job_stats().unwrap().all_time_succeeded, 2);
    }

    #[test]
    fn deleted_jobs_are_removed_only_after_the_grace_period() {
        let fx = fixture();
        let now = fx.clock.now();

        let make_deleted = |age: chrono::Duration| {
            let at = now - age;
            let mut job = Job::enqueued(details("t.Gone"), at);
            job.delete("cleanup", at);
            fx.storage.save_job(job).unwrap()
        };
        let old = make_deleted(chrono::Duration::hours(73));
        let young = make_deleted(chrono::Duration::hours(71) + chrono::Duration::minutes(59));

        fx.coordinator
            .check_for_deleted_jobs_ready_for_removal()
            .unwrap();

        assert!(fx.storage.get_job_by_id(old.id()).is_err());
        assert!(fx.storage.get_job_by_id(young.id()).is_ok());
    }

    #[test]
    fn master_tasks_are_a_noop_without_state_changes() {
        let fx = fixture();
        let now = fx.clock.now();
        let job = fx
            .storage
            .save_job(Job::scheduled(
                details("t.Future"),
                now + chrono::Duration::hours(1),
                None,
                now,
            ))
            .unwrap();

        fx.coordinator.run_master_tasks().unwrap();
        fx.coordinator.run_master_tasks().unwrap();

        // Re-running with no intervening change writes nothing.
        assert_eq!(fx.storage.get_job_by_id(job.id()).unwrap().version(), 1);
    }

    #[tokio::test]
    async fn enqueued_pull_respects_the_worker_pool_capacity() {
        let fx = fixture();
        let now = fx.clock.now();
        for i in 0..5 {
            fx.storage
                .save_job(Job::enqueued(details(&format!("t.Job{i}")), now))
                .unwrap();
        }

        // No handler registered: all onboarded jobs fail terminally, but the
        // pull itself must take at most worker_pool_size jobs.
        fx.coordinator.check_for_enqueued_jobs().unwrap();
        assert!(fx.storage.count_jobs(StateName::Enqueued).unwrap() >= 3);
    }

    /// Delegates to an in-memory provider but fails `get_recurring_jobs`,
    /// the first storage call of a master tick.
    #[derive(Clone)]
    struct BrokenRecurringStorage {
        inner: InMemoryStorageProvider,
        unavailable: bool,
    }

    impl crate::storage::StorageProvider for BrokenRecurringStorage {
        fn save_job(&self, job: Job) -> StorageResult<Job> {
            self.inner.save_job(job)
        }
        fn save_jobs(&self, jobs: Vec<Job>) -> StorageResult<Vec<Job>> {
            self.inner.save_jobs(jobs)
        }
        fn get_job_by_id(&self, id: Uuid) -> StorageResult<Job> {
            self.inner.get_job_by_id(id)
        }
        fn get_jobs(&self, state: StateName, page: PageRequest) -> StorageResult<Vec<Job>> {
            self.inner.get_jobs(state, page)
        }
        fn get_jobs_updated_before(
            &self,
            state: StateName,
            updated_before: DateTime<Utc>,
            page: PageRequest,
        ) -> StorageResult<Vec<Job>> {
            self.inner.get_jobs_updated_before(state, updated_before, page)
        }
        fn get_scheduled_jobs(
            &self,
            scheduled_before: DateTime<Utc>,
            page: PageRequest,
        ) -> StorageResult<Vec<Job>> {
            self.inner.get_scheduled_jobs(scheduled_before, page)
        }
        fn delete_jobs(
            &self,
            state: StateName,
            updated_before: DateTime<Utc>,
        ) -> StorageResult<usize> {
            self.inner.delete_jobs(state, updated_before)
        }
        fn exists(
            &self,
            details: &crate::jobs::JobDetails,
            state: StateName,
        ) -> StorageResult<bool> {
            self.inner.exists(details, state)
        }
        fn count_jobs(&self, state: StateName) -> StorageResult<u64> {
            self.inner.count_jobs(state)
        }
        fn get_job_stats(&self) -> StorageResult<crate::storage::JobStats> {
            self.inner.get_job_stats()
        }
        fn publish_job_stat_counter(&self, state: StateName, delta: u64) -> StorageResult<()> {
            self.inner.publish_job_stat_counter(state, delta)
        }
        fn get_recurring_jobs(&self) -> StorageResult<Vec<RecurringJob>> {
            if self.unavailable {
                Err(StorageError::Unavailable("connection refused".into()))
            } else {
                Err(StorageError::Internal(anyhow::anyhow!("index corrupted")))
            }
        }
        fn save_recurring_job(&self, job: RecurringJob) -> StorageResult<RecurringJob> {
            self.inner.save_recurring_job(job)
        }
        fn delete_recurring_job(&self, id: &str) -> StorageResult<()> {
            self.inner.delete_recurring_job(id)
        }
        fn announce_background_job_server(
            &self,
            status: &crate::storage::BackgroundJobServerStatus,
        ) -> StorageResult<()> {
            self.inner.announce_background_job_server(status)
        }
        fn signal_background_job_server_alive(
            &self,
            status: &crate::storage::BackgroundJobServerStatus,
        ) -> StorageResult<()> {
            self.inner.signal_background_job_server_alive(status)
        }
        fn get_background_job_servers(
            &self,
        ) -> StorageResult<Vec<crate::storage::BackgroundJobServerStatus>> {
            self.inner.get_background_job_servers()
        }
        fn remove_timed_out_background_job_servers(
            &self,
            heartbeat_older_than: DateTime<Utc>,
        ) -> StorageResult<usize> {
            self.inner
                .remove_timed_out_background_job_servers(heartbeat_older_than)
        }
        fn add_change_listener(&self, listener: crate::storage::StorageChangeListener) {
            self.inner.add_change_listener(listener)
        }
        fn remove_change_listener(&self, listener: &crate::storage::StorageChangeListener) {
            self.inner.remove_change_listener(listener)
        }
        fn close(&self) {
            self.inner.close()
        }
    }

    fn broken_fixture(unavailable: bool) -> Arc<JobCoordinator> {
        let storage = Arc::new(BrokenRecurringStorage {
            inner: InMemoryStorageProvider::new(),
            unavailable,
        });
        let config = crate::server::BackgroundJobServerConfiguration::default()
            .with_poll_interval_seconds(5)
            .with_worker_pool_size(2);
        let ctx = Arc::new(super::super::ServerContext {
            id: Uuid::new_v4(),
            worker_permits: Arc::new(Semaphore::new(config.worker_pool_size)),
            filters: JobFilters::with_default_filters(config.max_retries),
            config,
            storage,
            clock: Arc::new(ManualClock::starting_at(Utc::now())),
            handlers: Arc::new(JobHandlerRegistry::new()),
            processing: Arc::new(super::super::worker::ProcessingRegistry::new()),
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });
        let coordinator = JobCoordinator::new(ctx);
        coordinator.set_is_master(true);
        coordinator
    }

    #[test]
    fn five_failing_ticks_warn_and_the_sixth_shuts_the_server_down() {
        let coordinator = broken_fixture(false);
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            coordinator.run_tick();
            assert!(coordinator.ctx.running.load(Ordering::SeqCst));
        }

        coordinator.run_tick();
        assert!(!coordinator.ctx.running.load(Ordering::SeqCst));
        assert!(coordinator.ctx.shutdown.is_cancelled());
    }

    #[test]
    fn storage_unavailability_pauses_ticks_without_counting() {
        let coordinator = broken_fixture(true);
        for _ in 0..20 {
            coordinator.run_tick();
        }
        assert!(coordinator.ctx.running.load(Ordering::SeqCst));
        assert_eq!(
            coordinator.consecutive_failures.load(Ordering::SeqCst),
            0
        );
    }
}
