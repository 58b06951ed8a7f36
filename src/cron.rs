//! Cron expression parsing and evaluation.
//!
//! Wraps the `cron` crate's schedule type and accepts both the classic
//! five-field form (`min hour dom month dow`) and the six/seven-field form
//! with a leading seconds field. Five-field expressions fire at second zero,
//! so `* * * * *` means "every minute, on the minute".

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronParseError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },
    #[error("unknown time zone '{0}'")]
    UnknownTimeZone(String),
}

/// A parsed, immutable cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    expression: String,
    schedule: Schedule,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| CronParseError::InvalidExpression {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// The next fire instant strictly after `after`, evaluated in `zone`.
    ///
    /// Pure function of (expression, after, zone). Returns `None` when the
    /// expression has no future occurrence.
    pub fn next_after(&self, after: DateTime<Utc>, zone: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&zone);
        self.schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Resolve an IANA time zone name.
pub fn parse_zone(zone_id: &str) -> Result<Tz, CronParseError> {
    zone_id
        .parse::<Tz>()
        .map_err(|_| CronParseError::UnknownTimeZone(zone_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_five_field_expressions() {
        assert!(CronExpression::parse("* * * * *").is_ok());
        assert!(CronExpression::parse("*/15 2 * * 1-5").is_ok());
    }

    #[test]
    fn parses_six_field_expressions() {
        assert!(CronExpression::parse("0 0 0 * * *").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            CronExpression::parse("not a cron"),
            Err(CronParseError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn minutely_fires_on_the_minute() {
        let cron = CronExpression::parse("* * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 12).unwrap();
        let next = cron.next_after(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 31, 0).unwrap());
    }

    #[test]
    fn next_after_is_pure() {
        let cron = CronExpression::parse("0 4 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let zone = parse_zone("Europe/Brussels").unwrap();
        let a = cron.next_after(after, zone).unwrap();
        let b = cron.next_after(after, zone).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn next_after_respects_zone() {
        let cron = CronExpression::parse("0 4 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        // 04:00 in Brussels (CEST, UTC+2) is 02:00 UTC.
        let zone = parse_zone("Europe/Brussels").unwrap();
        let next = cron.next_after(after, zone).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap());
    }

    #[test]
    fn unknown_zone_is_an_error() {
        assert!(matches!(
            parse_zone("Mars/Olympus"),
            Err(CronParseError::UnknownTimeZone(_))
        ));
    }
}
