//! Job state records.
//!
//! A job's history is an append-only list of [`JobState`] records; the last
//! element is the current state. States are serialized with an `@class` tag so
//! the persisted JSON is self-describing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Discriminant of a [`JobState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateName {
    Scheduled,
    Enqueued,
    Processing,
    Succeeded,
    Failed,
    Deleted,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::Scheduled => "SCHEDULED",
            StateName::Enqueued => "ENQUEUED",
            StateName::Processing => "PROCESSING",
            StateName::Succeeded => "SUCCEEDED",
            StateName::Failed => "FAILED",
            StateName::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(StateName::Scheduled),
            "ENQUEUED" => Some(StateName::Enqueued),
            "PROCESSING" => Some(StateName::Processing),
            "SUCCEEDED" => Some(StateName::Succeeded),
            "FAILED" => Some(StateName::Failed),
            "DELETED" => Some(StateName::Deleted),
            _ => None,
        }
    }

    /// Terminal states end the normal lifecycle. A FAILED job may still be
    /// resurrected by the retry filter, but only at state election time.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateName::Succeeded | StateName::Failed | StateName::Deleted
        )
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "@class",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum JobState {
    Scheduled {
        /// When the state was appended; jobs are ordered by this, not by
        /// `scheduled_at`, which may lie far in the future.
        created_at: DateTime<Utc>,
        scheduled_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reason: Option<String>,
    },
    Enqueued {
        enqueued_at: DateTime<Utc>,
    },
    Processing {
        started_at: DateTime<Utc>,
        /// Advances on every heartbeat while the job runs; the only field of
        /// any state that mutates after the state is appended.
        updated_at: DateTime<Utc>,
        server_id: Uuid,
    },
    Succeeded {
        succeeded_at: DateTime<Utc>,
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
    Failed {
        failed_at: DateTime<Utc>,
        exception_kind: String,
        message: String,
        stacktrace: String,
    },
    Deleted {
        deleted_at: DateTime<Utc>,
        reason: String,
    },
}

impl JobState {
    pub fn name(&self) -> StateName {
        match self {
            JobState::Scheduled { .. } => StateName::Scheduled,
            JobState::Enqueued { .. } => StateName::Enqueued,
            JobState::Processing { .. } => StateName::Processing,
            JobState::Succeeded { .. } => StateName::Succeeded,
            JobState::Failed { .. } => StateName::Failed,
            JobState::Deleted { .. } => StateName::Deleted,
        }
    }

    /// When this state was last touched. For PROCESSING this is the heartbeat
    /// timestamp, which makes it the job's `updated_at` for ordering and for
    /// orphan detection.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            JobState::Scheduled { created_at, .. } => *created_at,
            JobState::Enqueued { enqueued_at } => *enqueued_at,
            JobState::Processing { updated_at, .. } => *updated_at,
            JobState::Succeeded { succeeded_at, .. } => *succeeded_at,
            JobState::Failed { failed_at, .. } => *failed_at,
            JobState::Deleted { deleted_at, .. } => *deleted_at,
        }
    }
}

/// Serde helper storing a `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
