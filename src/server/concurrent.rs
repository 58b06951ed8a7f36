//! Resolution of concurrent job modifications.
//!
//! When a batch save loses the optimistic-concurrency race the resolver
//! decides, per conflicting (local, remote) pair, whether the local write can
//! be re-applied on top of the remote version, must be dropped, or signals
//! corruption. Policy: deletions always land, heartbeats merge, a local
//! decision loses to any other remote transition, and a remote history with
//! an impossible succession is fatal.

use super::worker::ProcessingRegistry;
use crate::jobs::{Job, JobState, StateName};
use crate::storage::{ConcurrentJobModification, StorageError, StorageProvider, StorageResult};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct ConcurrentJobModificationResolver {
    storage: Arc<dyn StorageProvider>,
    processing: Arc<ProcessingRegistry>,
}

impl ConcurrentJobModificationResolver {
    pub fn new(storage: Arc<dyn StorageProvider>, processing: Arc<ProcessingRegistry>) -> Self {
        Self {
            storage,
            processing,
        }
    }

    pub fn resolve(
        &self,
        conflicts: Vec<ConcurrentJobModification>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        for conflict in conflicts {
            self.resolve_one(conflict, now)?;
        }
        Ok(())
    }

    fn resolve_one(
        &self,
        conflict: ConcurrentJobModification,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let ConcurrentJobModification { local, remote } = conflict;
        let Some(remote) = remote else {
            debug!(job_id = %local.id(), "job was removed by another writer; dropping local write");
            if let Some(handle) = self.processing.get(local.id()) {
                handle.cancel();
            }
            return Ok(());
        };

        validate_history(&remote)?;

        if remote.state_name() == StateName::Deleted {
            debug!(job_id = %remote.id(), "job was deleted by another writer");
            if let Some(handle) = self.processing.get(remote.id()) {
                handle.cancel();
            }
            return Ok(());
        }

        if local.state_name() == StateName::Deleted {
            return self.reapply_deletion(&local, remote, now);
        }

        match remote.state_name() {
            StateName::Succeeded | StateName::Failed => {
                debug!(
                    job_id = %local.id(),
                    remote_state = %remote.state_name(),
                    "job reached a terminal state on another writer; dropping local write"
                );
                Ok(())
            }
            StateName::Processing => self.resolve_against_heartbeat(local, remote),
            _ => {
                debug!(
                    job_id = %local.id(),
                    remote_state = %remote.state_name(),
                    "remote transition invalidates local write; dropping"
                );
                Ok(())
            }
        }
    }

    /// Copy a local deletion onto the remote version of the job.
    fn reapply_deletion(
        &self,
        local: &Job,
        mut remote: Job,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        if let JobState::Deleted { reason, .. } = local.state() {
            remote.delete(reason.clone(), now);
        }
        if let Some(handle) = self.processing.get(remote.id()) {
            handle.cancel();
        }
        self.save_resolved(remote)
    }

    fn resolve_against_heartbeat(&self, local: Job, mut remote: Job) -> StorageResult<()> {
        let local_len = local.history().len();
        let remote_len = remote.history().len();

        if local.state_name() == StateName::Processing && local_len == remote_len {
            // Heartbeat against heartbeat: either write is fine, keep the
            // newer timestamp on the remote version.
            let newest = local.updated_at().max(remote.updated_at());
            let _ = remote.update_processing(newest);
            return self.save_resolved(remote);
        }

        if local_len > remote_len && self.processing.get(local.id()).is_some() {
            // Our completion raced our own heartbeat; a heartbeat cannot
            // invalidate it, so rebase the appended states onto the
            // heartbeat version.
            for state in local.states_after(remote_len) {
                remote.push_state(state.clone());
            }
            return self.save_resolved(remote);
        }

        debug!(
            job_id = %local.id(),
            "job is being processed by another server; dropping local write"
        );
        Ok(())
    }

    fn save_resolved(&self, job: Job) -> StorageResult<()> {
        match self.storage.save_job(job) {
            Ok(saved) => {
                if let Some(handle) = self.processing.get(saved.id()) {
                    handle.set_job(saved);
                }
                Ok(())
            }
            Err(StorageError::ConcurrentModification(_)) => {
                debug!("resolved write conflicted again; leaving it for the next tick");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// A job can never leave SUCCEEDED or DELETED except for cleanup, and FAILED
/// only through a retry or a deletion. Anything else in a persisted history
/// is a symptom of corruption and must surface loudly.
fn validate_history(job: &Job) -> StorageResult<()> {
    for pair in job.history().windows(2) {
        let (from, to) = (pair[0].name(), pair[1].name());
        let illegal = match from {
            StateName::Succeeded => to != StateName::Deleted,
            StateName::Deleted => true,
            StateName::Failed => !matches!(to, StateName::Scheduled | StateName::Deleted),
            _ => false,
        };
        if illegal {
            return Err(StorageError::Internal(anyhow!(
                "job {} regressed from {from} to {to}; refusing to resolve",
                job.id()
            )));
        }
    }
    Ok(())
}
