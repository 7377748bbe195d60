//! Minimal five-field cron matcher.
//!
//! Supports the subset the job catalog actually uses: `*`, `*/n`, plain
//! numbers and comma lists, over minute / hour / day-of-month / month /
//! day-of-week (0 = Sunday). Evaluated in UTC.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    List(Vec<u32>),
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32) -> Result<Self> {
        if raw == "*" {
            return Ok(Field::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            let step: u32 = step.parse().with_context(|| format!("bad step {raw:?}"))?;
            if step == 0 {
                bail!("zero step in {raw:?}");
            }
            return Ok(Field::Step(step));
        }
        let mut values = Vec::new();
        for part in raw.split(',') {
            let value: u32 = part
                .parse()
                .with_context(|| format!("bad cron field {raw:?}"))?;
            if value < min || value > max {
                bail!("cron value {value} outside {min}..={max}");
            }
            values.push(value);
        }
        Ok(Field::List(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(step) => value % step == 0,
            Field::List(values) => values.contains(&value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("cron expression needs 5 fields, got {}: {expr:?}", fields.len());
        }
        Ok(Self {
            minute: Field::parse(fields[0], 0, 59)?,
            hour: Field::parse(fields[1], 0, 23)?,
            day_of_month: Field::parse(fields[2], 1, 31)?,
            month: Field::parse(fields[3], 1, 12)?,
            day_of_week: Field::parse(fields[4], 0, 6)?,
        })
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `t`. Bounded scan; the catalog's
    /// expressions all fire at least yearly.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = t.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_six_hours() {
        let cron = CronExpr::parse("0 */6 * * *").unwrap();
        assert!(cron.matches(at(2024, 9, 14, 0, 0)));
        assert!(cron.matches(at(2024, 9, 14, 6, 0)));
        assert!(cron.matches(at(2024, 9, 14, 18, 0)));
        assert!(!cron.matches(at(2024, 9, 14, 7, 0)));
        assert!(!cron.matches(at(2024, 9, 14, 6, 1)));

        assert_eq!(
            cron.next_after(at(2024, 9, 14, 6, 0)),
            Some(at(2024, 9, 14, 12, 0))
        );
    }

    #[test]
    fn sunday_two_am() {
        let cron = CronExpr::parse("0 2 * * 0").unwrap();
        // 2024-09-15 is a Sunday.
        assert!(cron.matches(at(2024, 9, 15, 2, 0)));
        assert!(!cron.matches(at(2024, 9, 14, 2, 0)));
        assert_eq!(
            cron.next_after(at(2024, 9, 14, 12, 0)),
            Some(at(2024, 9, 15, 2, 0))
        );
    }

    #[test]
    fn daily_at_three() {
        let cron = CronExpr::parse("0 3 * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 9, 14, 3, 0)),
            Some(at(2024, 9, 15, 3, 0))
        );
        assert_eq!(
            cron.next_after(at(2024, 9, 14, 2, 59)),
            Some(at(2024, 9, 14, 3, 0))
        );
    }

    #[test]
    fn comma_lists() {
        let cron = CronExpr::parse("0,30 9,21 * * *").unwrap();
        assert!(cron.matches(at(2024, 9, 14, 9, 30)));
        assert!(cron.matches(at(2024, 9, 14, 21, 0)));
        assert!(!cron.matches(at(2024, 9, 14, 10, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronExpr::parse("0 3 * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a b c d e").is_err());
    }
}
