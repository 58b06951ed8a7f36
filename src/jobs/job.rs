//! The job aggregate.
//!
//! A [`Job`] carries its identity, the [`JobDetails`] descriptor, a version
//! counter for optimistic concurrency and an ordered, append-only history of
//! [`JobState`] records. All transition methods take the current time as an
//! argument so callers decide the clock.

use super::details::JobDetails;
use super::state::{JobState, StateName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A state transition that the job's lifecycle does not permit, e.g. marking
/// a SCHEDULED job as succeeded.
#[derive(Debug, Clone, thiserror::Error)]
#[error("job {id}: illegal state transition from {from} to {to}")]
pub struct IllegalJobState {
    pub id: Uuid,
    pub from: StateName,
    pub to: StateName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    id: Uuid,
    version: u32,
    job_signature: String,
    #[serde(rename = "jobDetails")]
    details: JobDetails,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    recurring_job_id: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    history: Vec<JobState>,
}

impl Job {
    /// A new job that is immediately runnable.
    pub fn enqueued(details: JobDetails, now: DateTime<Utc>) -> Self {
        Self::with_initial_state(details, None, JobState::Enqueued { enqueued_at: now })
    }

    /// A new job that becomes runnable at `scheduled_at`.
    pub fn scheduled(
        details: JobDetails,
        scheduled_at: DateTime<Utc>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_initial_state(
            details,
            None,
            JobState::Scheduled {
                created_at: now,
                scheduled_at,
                reason,
            },
        )
    }

    /// A materialized occurrence of a recurring job.
    pub fn recurring_occurrence(
        details: JobDetails,
        recurring_job_id: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let recurring_job_id = recurring_job_id.into();
        let reason = format!("Occurrence of recurring job '{recurring_job_id}'");
        Self::with_initial_state(
            details,
            Some(recurring_job_id),
            JobState::Scheduled {
                created_at: now,
                scheduled_at,
                reason: Some(reason),
            },
        )
    }

    fn with_initial_state(
        details: JobDetails,
        recurring_job_id: Option<String>,
        state: JobState,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 0,
            job_signature: details.signature(),
            details,
            recurring_job_id,
            metadata: BTreeMap::new(),
            history: vec![state],
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn details(&self) -> &JobDetails {
        &self.details
    }

    pub fn signature(&self) -> &str {
        &self.job_signature
    }

    pub fn recurring_job_id(&self) -> Option<&str> {
        self.recurring_job_id.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.metadata
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// The current state record. History is never empty.
    pub fn state(&self) -> &JobState {
        self.history.last().expect("job history is never empty")
    }

    pub fn state_name(&self) -> StateName {
        self.state().name()
    }

    pub fn has_state(&self, name: StateName) -> bool {
        self.state_name() == name
    }

    /// Names of all history entries in order; convenient in assertions.
    pub fn state_names(&self) -> Vec<StateName> {
        self.history.iter().map(JobState::name).collect()
    }

    /// When the job was created: the timestamp of its first state.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.history[0].occurred_at()
    }

    /// When the job was last touched: the timestamp of its current state,
    /// which for PROCESSING advances on every heartbeat.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state().occurred_at()
    }

    /// The instant a currently SCHEDULED job becomes due, if scheduled.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self.state() {
            JobState::Scheduled { scheduled_at, .. } => Some(*scheduled_at),
            _ => None,
        }
    }

    /// Number of FAILED entries in the history; drives retry exhaustion.
    pub fn failed_count(&self) -> usize {
        self.history
            .iter()
            .filter(|s| s.name() == StateName::Failed)
            .count()
    }

    /// SCHEDULED -> ENQUEUED, performed by the master when the job is due.
    pub fn enqueue(&mut self, now: DateTime<Utc>) -> Result<(), IllegalJobState> {
        match self.state_name() {
            StateName::Scheduled => {
                self.history.push(JobState::Enqueued { enqueued_at: now });
                Ok(())
            }
            from => Err(self.illegal(from, StateName::Enqueued)),
        }
    }

    /// ENQUEUED -> PROCESSING, the moment of acquisition by a server.
    pub fn start_processing(
        &mut self,
        server_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalJobState> {
        match self.state_name() {
            StateName::Enqueued => {
                self.history.push(JobState::Processing {
                    started_at: now,
                    updated_at: now,
                    server_id,
                });
                Ok(())
            }
            from => Err(self.illegal(from, StateName::Processing)),
        }
    }

    /// Heartbeat: refresh the PROCESSING `updated_at` in place. The only
    /// mutation of an already-appended state.
    pub fn update_processing(&mut self, now: DateTime<Utc>) -> Result<(), IllegalJobState> {
        let id = self.id;
        match self.history.last_mut() {
            Some(JobState::Processing { updated_at, .. }) => {
                *updated_at = now;
                Ok(())
            }
            Some(other) => Err(IllegalJobState {
                id,
                from: other.name(),
                to: StateName::Processing,
            }),
            None => unreachable!("job history is never empty"),
        }
    }

    /// PROCESSING -> SUCCEEDED. Duration is measured from `started_at`.
    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<(), IllegalJobState> {
        match self.state() {
            JobState::Processing { started_at, .. } => {
                let duration = (now - *started_at).to_std().unwrap_or_default();
                self.history.push(JobState::Succeeded {
                    succeeded_at: now,
                    duration,
                });
                Ok(())
            }
            other => Err(self.illegal(other.name(), StateName::Succeeded)),
        }
    }

    /// -> FAILED, from PROCESSING (execution error, orphan detection) or
    /// ENQUEUED (the job could not be started at all).
    pub fn fail(
        &mut self,
        exception_kind: impl Into<String>,
        message: impl Into<String>,
        stacktrace: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalJobState> {
        match self.state_name() {
            StateName::Processing | StateName::Enqueued => {
                self.history.push(JobState::Failed {
                    failed_at: now,
                    exception_kind: exception_kind.into(),
                    message: message.into(),
                    stacktrace: stacktrace.into(),
                });
                Ok(())
            }
            from => Err(self.illegal(from, StateName::Failed)),
        }
    }

    /// FAILED -> SCHEDULED, appended by the retry filter.
    pub fn reschedule(
        &mut self,
        scheduled_at: DateTime<Utc>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalJobState> {
        match self.state_name() {
            StateName::Failed => {
                self.history.push(JobState::Scheduled {
                    created_at: now,
                    scheduled_at,
                    reason: Some(reason.into()),
                });
                Ok(())
            }
            from => Err(self.illegal(from, StateName::Scheduled)),
        }
    }

    /// -> DELETED. Allowed from every state; deleting an already deleted job
    /// is a no-op.
    pub fn delete(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.state_name() == StateName::Deleted {
            return;
        }
        self.history.push(JobState::Deleted {
            deleted_at: now,
            reason: reason.into(),
        });
    }

    /// Re-apply the states this job added on top of `base_len` onto another
    /// copy of the job; used when rebasing a local write onto a concurrently
    /// modified remote version.
    pub(crate) fn states_after(&self, base_len: usize) -> &[JobState] {
        &self.history[base_len.min(self.history.len())..]
    }

    pub(crate) fn push_state(&mut self, state: JobState) {
        self.history.push(state);
    }

    fn illegal(&self, from: StateName, to: StateName) -> IllegalJobState {
        IllegalJobState {
            id: self.id,
            from,
            to,
        }
    }
}
