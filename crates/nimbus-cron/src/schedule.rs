//! Cron expression parsing.
//!
//! Five fields (minute, hour, day-of-month, month, day-of-week) or one of
//! the descriptors below. Evaluation is in UTC.

use chrono::Utc;
use croner::Cron;
use thiserror::Error;

use nimbus_core::CoreError;
use nimbus_state::Timestamp;

const DESCRIPTORS: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    Invalid { expr: String, reason: String },
    #[error("cron expression `{0}` has no upcoming occurrence")]
    NoUpcoming(String),
}

impl From<CronError> for CoreError {
    fn from(e: CronError) -> Self {
        CoreError::InvalidInput(e.to_string())
    }
}

/// A parsed schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    expr: String,
    cron: Cron,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        let pattern = if trimmed.starts_with('@') {
            DESCRIPTORS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
                .map(|(_, pattern)| *pattern)
                .ok_or_else(|| CronError::Invalid {
                    expr: trimmed.to_string(),
                    reason: "unknown descriptor".into(),
                })?
        } else {
            let fields = trimmed.split_whitespace().count();
            if fields != 5 {
                return Err(CronError::Invalid {
                    expr: trimmed.to_string(),
                    reason: format!("expected 5 fields, got {fields}"),
                });
            }
            trimmed
        };

        let cron = Cron::new(pattern).parse().map_err(|e| CronError::Invalid {
            expr: trimmed.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: trimmed.to_string(),
            cron,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: Timestamp) -> Result<Timestamp, CronError> {
        self.cron
            .find_next_occurrence(&after.with_timezone(&Utc), false)
            .map_err(|_| CronError::NoUpcoming(self.expr.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let s = Schedule::parse("*/5 * * * *").unwrap();
        assert_eq!(s.next_after(at(10, 2, 30)).unwrap(), at(10, 5, 0));
        // Strictly after: an exact match moves to the next slot.
        assert_eq!(s.next_after(at(10, 5, 0)).unwrap(), at(10, 10, 0));
    }

    #[test]
    fn descriptors_expand() {
        let s = Schedule::parse("@daily").unwrap();
        assert_eq!(
            s.next_after(at(10, 0, 0)).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(s.expr(), "@daily");
        assert!(Schedule::parse("@HOURLY").is_ok());
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["", "* * * *", "0 0 * * * *", "61 * * * *", "@fortnightly", "a b c d e"] {
            assert!(Schedule::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn maps_to_invalid_input() {
        let err: CoreError = Schedule::parse("nope").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
