//! Cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Fields: `*`, `N`, `a-b`, lists `a,b,c`, steps `*/s`, `a-b/s`, `N/s`.
//! Month names (`JAN`..`DEC`) and weekday names (`SUN`..`SAT`); `7` is Sunday.
//! Macros: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`, `@hourly`.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either matches (classic Vixie cron). A field is unrestricted when it starts
//! with `*`.

use autoloom_core::error::{AutoloomError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// Upper bound for the next-match search: covers Feb 29 on a given weekday.
const SEARCH_DAYS: u32 = 366 * 30;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(expression, "unknown macro"));
            }
            _ => trimmed,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(
                expression,
                "need 5 fields: MIN HOUR DOM MON DOW",
            ));
        }

        let field = |idx: usize, min: u32, max: u32, names: &[&str]| -> Result<u64> {
            parse_field(parts[idx], min, max, names)
                .map_err(|reason| invalid(expression, &reason))
        };

        let minutes = field(0, 0, 59, &[][..])?;
        let hours = field(1, 0, 23, &[][..])?;
        let days_of_month = field(2, 1, 31, &[][..])?;
        let months = field(3, 1, 12, &MONTH_NAMES[..])?;
        let mut days_of_week = field(4, 0, 7, &DAY_NAMES[..])?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: trimmed.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether `at` (to the minute) matches this schedule.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.day_matches(at.date_naive())
            && bit(self.hours, at.hour())
            && bit(self.minutes, at.minute())
    }

    /// First matching minute strictly after `after`, seconds zeroed.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);
        let start_date = start.date_naive();

        let mut date = start_date;
        for _ in 0..SEARCH_DAYS {
            if self.day_matches(date) {
                let first_day = date == start_date;
                let hour_from = if first_day { start.hour() } else { 0 };
                for hour in hour_from..24 {
                    if !bit(self.hours, hour) {
                        continue;
                    }
                    let minute_from = if first_day && hour == start.hour() {
                        start.minute()
                    } else {
                        0
                    };
                    if let Some(minute) = (minute_from..60).find(|m| bit(self.minutes, *m)) {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !bit(self.months, date.month()) {
            return false;
        }
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

/// Parse an expression and compute the next run time after `after`.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(CronSchedule::parse(expression)?.next_after(after))
}

fn invalid(expression: &str, reason: &str) -> AutoloomError {
    AutoloomError::config(format!("invalid cron expression '{expression}': {reason}"))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

/// Parse one cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in '{field}'"));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step '{step}'"))?;
                if step == 0 {
                    return Err("step must be positive".into());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, min, max, names)?, value(b, min, max, names)?)
        } else {
            let v = value(range, min, max, names)?;
            // "N/s" runs from N to the end of the field
            if step.is_some() { (v, max) } else { (v, v) }
        };
        if lo > hi {
            return Err(format!("range '{range}' runs backwards"));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn value(token: &str, min: u32, max: u32, names: &[&str]) -> std::result::Result<u32, String> {
    let upper = token.to_ascii_uppercase();
    if let Some(pos) = names.iter().position(|n| *n == upper) {
        // JAN is 1, SUN is 0
        return Ok(pos as u32 + min);
    }
    let v: u32 = token
        .parse()
        .map_err(|_| format!("'{token}' is not a number"))?;
    if v < min || v > max {
        return Err(format!("{v} outside {min}-{max}"));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        next_run_from_cron(expr, after).unwrap().unwrap()
    }

    #[test]
    fn test_every_hour() {
        let n = next("0 * * * *", at(2026, 2, 22, 10, 30));
        assert_eq!(n, at(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_specific_time_rolls_to_next_day() {
        assert_eq!(next("0 9 * * *", at(2026, 2, 22, 7, 0)), at(2026, 2, 22, 9, 0));
        assert_eq!(next("0 9 * * *", at(2026, 2, 22, 9, 0)), at(2026, 2, 23, 9, 0));
    }

    #[test]
    fn test_strictly_after_with_seconds_zeroed() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 30).unwrap();
        assert_eq!(next("* * * * *", after), at(2026, 2, 22, 10, 1));
    }

    #[test]
    fn test_steps_ranges_and_lists() {
        assert_eq!(next("*/15 * * * *", at(2026, 2, 22, 10, 2)).minute(), 15);
        assert_eq!(next("10-20/5 * * * *", at(2026, 2, 22, 10, 16)).minute(), 20);
        assert_eq!(next("5/20 * * * *", at(2026, 2, 22, 10, 26)).minute(), 45);
        assert_eq!(next("0 9,21 * * *", at(2026, 2, 22, 10, 0)), at(2026, 2, 22, 21, 0));
    }

    #[test]
    fn test_weekday_and_month_names() {
        // 2026-02-22 is a Sunday
        assert_eq!(next("0 9 * * MON", at(2026, 2, 22, 10, 0)), at(2026, 2, 23, 9, 0));
        assert_eq!(next("0 0 1 mar *", at(2026, 2, 22, 0, 0)), at(2026, 3, 1, 0, 0));
        assert_eq!(next("0 9 * * 1-5", at(2026, 2, 21, 10, 0)), at(2026, 2, 23, 9, 0));
    }

    #[test]
    fn test_seven_is_sunday() {
        assert_eq!(next("0 8 * * 7", at(2026, 2, 23, 0, 0)), at(2026, 3, 1, 8, 0));
        assert_eq!(
            CronSchedule::parse("0 8 * * 7").unwrap(),
            CronSchedule {
                expression: "0 8 * * 7".into(),
                ..CronSchedule::parse("0 8 * * 0").unwrap()
            }
        );
    }

    #[test]
    fn test_dom_dow_or_semantics() {
        // The 13th or any Friday, whichever comes first
        let schedule = CronSchedule::parse("0 0 13 * FRI").unwrap();
        assert_eq!(schedule.next_after(at(2026, 2, 1, 0, 0)).unwrap(), at(2026, 2, 6, 0, 0));
        assert_eq!(schedule.next_after(at(2026, 2, 10, 0, 0)).unwrap(), at(2026, 2, 13, 0, 0));

        // Only DOM restricted: weekday field ignored
        assert_eq!(next("0 0 15 * *", at(2026, 2, 1, 0, 0)), at(2026, 2, 15, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 0 29 2 *", at(2026, 3, 1, 0, 0)), at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_macros() {
        assert_eq!(next("@hourly", at(2026, 2, 22, 10, 30)), at(2026, 2, 22, 11, 0));
        assert_eq!(next("@daily", at(2026, 2, 22, 10, 30)), at(2026, 2, 23, 0, 0));
        assert_eq!(next("@monthly", at(2026, 2, 22, 10, 30)), at(2026, 3, 1, 0, 0));
        assert_eq!(next("@yearly", at(2026, 2, 22, 10, 30)), at(2027, 1, 1, 0, 0));
    }

    #[test]
    fn test_idempotent_next() {
        for expr in ["0 9 * * *", "*/7 3-5 * * *", "30 12 1,15 * MON", "@weekly"] {
            let schedule = CronSchedule::parse(expr).unwrap();
            let mut t = at(2026, 1, 1, 0, 0);
            for _ in 0..20 {
                let n = schedule.next_after(t).unwrap();
                assert!(n > t);
                assert!(schedule.matches(n));
                // Any reference between t and n yields the same n
                assert_eq!(schedule.next_after(n - Duration::seconds(1)).unwrap(), n);
                assert_eq!(schedule.next_after(t).unwrap(), n);
                t = n;
            }
        }
    }

    #[test]
    fn test_upcoming() {
        let times = CronSchedule::parse("0 */6 * * *")
            .unwrap()
            .upcoming(at(2026, 2, 22, 1, 0), 3);
        assert_eq!(
            times,
            vec![at(2026, 2, 22, 6, 0), at(2026, 2, 22, 12, 0), at(2026, 2, 22, 18, 0)]
        );
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["bad", "* * * *", "60 * * * *", "*/0 * * * *", "5-1 * * * *", "0 0 * FOO *", "@every", "1,,2 * * * *"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert!(matches!(err, AutoloomError::Config(_)), "{bad}");
        }
    }
}
