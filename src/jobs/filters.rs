//! Pluggable job filters.
//!
//! Filters hook into every batch save: `on_state_election` runs before
//! persistence and may still change the proposed state, `on_state_applied`
//! runs after persistence succeeded and is purely observational. The default
//! chain contains the [`RetryFilter`].

use super::job::Job;
use super::state::StateName;
use crate::scheduling::registry::{ERROR_KIND_HANDLER_NOT_FOUND, ERROR_KIND_METHOD_NOT_FOUND};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

pub trait JobFilter: Send + Sync {
    /// Called before the batch write; sees the proposed new state and may
    /// mutate it further.
    fn on_state_election(&self, _job: &mut Job, _now: DateTime<Utc>) {}

    /// Called after the batch write succeeded.
    fn on_state_applied(&self, _job: &Job, _now: DateTime<Utc>) {}
}

/// An ordered chain of filters, applied to every job of a batch.
#[derive(Clone, Default)]
pub struct JobFilters {
    filters: Vec<Arc<dyn JobFilter>>,
}

impl JobFilters {
    /// The default chain: retries failed jobs with exponential backoff.
    pub fn with_default_filters(max_retries: u32) -> Self {
        Self {
            filters: vec![Arc::new(RetryFilter::new(max_retries))],
        }
    }

    pub fn push(&mut self, filter: Arc<dyn JobFilter>) {
        self.filters.push(filter);
    }

    pub fn run_on_state_election(&self, jobs: &mut [Job], now: DateTime<Utc>) {
        for job in jobs.iter_mut() {
            for filter in &self.filters {
                filter.on_state_election(job, now);
            }
        }
    }

    pub fn run_on_state_applied(&self, jobs: &[Job], now: DateTime<Utc>) {
        for job in jobs {
            for filter in &self.filters {
                filter.on_state_applied(job, now);
            }
        }
    }
}

/// Reschedules failed jobs with exponential backoff and jitter.
///
/// A job entering FAILED gets a SCHEDULED state appended at
/// `now + 3^attempt seconds` (±10% jitter) as long as it has failed at most
/// `max_retries` times. Failures that cannot succeed on replay (unresolvable
/// handler or method) are left FAILED terminally.
pub struct RetryFilter {
    max_retries: u32,
}

impl RetryFilter {
    pub const DEFAULT_MAX_RETRIES: u32 = 10;

    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = 3f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::milliseconds((base * jitter * 1000.0) as i64)
    }

    fn is_retryable(exception_kind: &str) -> bool {
        !matches!(
            exception_kind,
            ERROR_KIND_HANDLER_NOT_FOUND | ERROR_KIND_METHOD_NOT_FOUND
        )
    }
}

impl Default for RetryFilter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_RETRIES)
    }
}

impl JobFilter for RetryFilter {
    fn on_state_election(&self, job: &mut Job, now: DateTime<Utc>) {
        if job.state_name() != StateName::Failed {
            return;
        }
        let exception_kind = match job.state() {
            crate::jobs::JobState::Failed { exception_kind, .. } => exception_kind.clone(),
            _ => return,
        };
        if !Self::is_retryable(&exception_kind) {
            debug!(job_id = %job.id(), kind = %exception_kind, "not retrying unresolvable job");
            return;
        }
        let attempt = job.failed_count() as u32;
        if attempt > self.max_retries {
            debug!(job_id = %job.id(), attempt, "job exhausted its retries");
            return;
        }
        let scheduled_at = now + self.backoff(attempt);
        let reason = format!("Retry {attempt} of {}", self.max_retries);
        if let Err(e) = job.reschedule(scheduled_at, reason, now) {
            debug!("retry filter skipped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::details::DEFAULT_METHOD;
    use crate::jobs::JobDetails;
    use uuid::Uuid;

    fn failed_job(kind: &str, now: DateTime<Utc>) -> Job {
        let mut job = Job::enqueued(JobDetails::new("tests.Flaky", DEFAULT_METHOD, vec![]), now);
        job.start_processing(Uuid::new_v4(), now).unwrap();
        job.fail(kind, "boom", "stack", now).unwrap();
        job
    }

    #[test]
    fn failed_job_is_rescheduled_with_backoff() {
        let now = Utc::now();
        let mut job = failed_job("Error", now);
        let filters = JobFilters::with_default_filters(10);

        filters.run_on_state_election(std::slice::from_mut(&mut job), now);

        assert_eq!(job.state_name(), StateName::Scheduled);
        let scheduled_at = job.scheduled_at().unwrap();
        let delay = scheduled_at - now;
        // attempt 1: 3s +- 10% jitter
        assert!(delay >= Duration::milliseconds(2700), "delay was {delay}");
        assert!(delay <= Duration::milliseconds(3300), "delay was {delay}");
    }

    #[test]
    fn backoff_grows_exponentially() {
        let filter = RetryFilter::new(10);
        let first = filter.backoff(1).num_milliseconds();
        let fourth = filter.backoff(4).num_milliseconds();
        assert!(first < 3_300);
        assert!(fourth > 72_000 && fourth < 90_000, "was {fourth}");
    }

    #[test]
    fn exhausted_job_stays_failed() {
        let now = Utc::now();
        let server = Uuid::new_v4();
        let mut job = Job::enqueued(JobDetails::new("tests.Flaky", DEFAULT_METHOD, vec![]), now);
        for _ in 0..3 {
            job.start_processing(server, now).unwrap();
            job.fail("Error", "boom", "stack", now).unwrap();
            if job.failed_count() < 3 {
                job.reschedule(now, "retry", now).unwrap();
                job.enqueue(now).unwrap();
            }
        }
        let filters = JobFilters::with_default_filters(2);

        filters.run_on_state_election(std::slice::from_mut(&mut job), now);

        assert_eq!(job.state_name(), StateName::Failed);
    }

    #[test]
    fn unresolvable_handler_is_never_retried() {
        let now = Utc::now();
        let mut job = failed_job(ERROR_KIND_HANDLER_NOT_FOUND, now);
        let filters = JobFilters::with_default_filters(10);

        filters.run_on_state_election(std::slice::from_mut(&mut job), now);

        assert_eq!(job.state_name(), StateName::Failed);
    }

    #[test]
    fn succeeded_job_is_untouched() {
        let now = Utc::now();
        let mut job = Job::enqueued(JobDetails::new("tests.Ok", DEFAULT_METHOD, vec![]), now);
        job.start_processing(Uuid::new_v4(), now).unwrap();
        job.succeed(now).unwrap();
        let before = job.clone();
        let filters = JobFilters::with_default_filters(10);

        filters.run_on_state_election(std::slice::from_mut(&mut job), now);

        assert_eq!(job, before);
    }
}
