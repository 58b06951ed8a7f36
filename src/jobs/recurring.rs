//! Recurring job definitions.

use super::details::JobDetails;
use super::job::Job;
use crate::cron::{parse_zone, CronExpression, CronParseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cron-driven job template. The master materializes one SCHEDULED
/// occurrence per fire instant, deduplicated on the job signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringJob {
    id: String,
    #[serde(rename = "jobDetails")]
    details: JobDetails,
    cron_expression: String,
    zone_id: String,
}

impl RecurringJob {
    /// Create a recurring job, validating the cron expression and time zone.
    /// When `id` is `None` it is derived from the job signature.
    pub fn new(
        id: Option<String>,
        details: JobDetails,
        cron_expression: &str,
        zone_id: &str,
    ) -> Result<Self, CronParseError> {
        CronExpression::parse(cron_expression)?;
        parse_zone(zone_id)?;
        let id = id.unwrap_or_else(|| {
            details
                .signature()
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect()
        });
        Ok(Self {
            id,
            details,
            cron_expression: cron_expression.to_string(),
            zone_id: zone_id.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn details(&self) -> &JobDetails {
        &self.details
    }

    pub fn cron_expression(&self) -> &str {
        &self.cron_expression
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    /// Next fire instant strictly after `after`, in this job's time zone.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cron = CronExpression::parse(&self.cron_expression).ok()?;
        let zone = parse_zone(&self.zone_id).ok()?;
        cron.next_after(after, zone)
    }

    /// Materialize a SCHEDULED occurrence of this recurring job.
    pub fn materialize(&self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        Job::recurring_occurrence(self.details.clone(), self.id.clone(), scheduled_at, now)
    }
}
