// Cron expression validation and next fire time calculation
//
// Expressions are accepted in the classic five-field form (minute precision)
// or in the cron crate's native six/seven-field form with a leading seconds
// field. Evaluation happens in the configured timezone; results are epoch
// seconds.

use crate::errors::ScheduleError;
use crate::models::Timestamp;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Evaluates recurrence expressions for the scheduler
pub trait CronEvaluator: Send + Sync {
    /// Whether the expression is syntactically valid
    fn validate(&self, expression: &str) -> bool;

    /// First fire instant strictly after `from`
    fn next_fire_after(&self, expression: &str, from: Timestamp)
        -> Result<Timestamp, ScheduleError>;
}

/// `CronEvaluator` backed by the `cron` crate
#[derive(Debug, Clone)]
pub struct CronExpressionEvaluator {
    timezone: Tz,
}

impl CronExpressionEvaluator {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// Build an evaluator from an IANA timezone name such as `Europe/Berlin`
    pub fn with_timezone_name(name: &str) -> Result<Self, ScheduleError> {
        let timezone =
            Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))?;
        Ok(Self::new(timezone))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl Default for CronExpressionEvaluator {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl CronEvaluator for CronExpressionEvaluator {
    fn validate(&self, expression: &str) -> bool {
        parse_cron_expression(expression).is_ok()
    }

    fn next_fire_after(
        &self,
        expression: &str,
        from: Timestamp,
    ) -> Result<Timestamp, ScheduleError> {
        let schedule = parse_cron_expression(expression)?;

        let reference = Utc
            .timestamp_opt(from, 0)
            .single()
            .ok_or_else(|| ScheduleError::NoNextFireTime(expression.to_string()))?;
        let reference_in_tz: DateTime<Tz> = reference.with_timezone(&self.timezone);

        let next = schedule
            .after(&reference_in_tz)
            .next()
            .ok_or_else(|| ScheduleError::NoNextFireTime(expression.to_string()))?;

        Ok(next.with_timezone(&Utc).timestamp())
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let normalized = normalize_expression(expression);
    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Prefix five-field expressions with a zero seconds field and renumber
/// their day-of-week field
fn normalize_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day_of_month, month, day_of_week] => format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day_of_month,
            month,
            normalize_day_of_week(day_of_week)
        ),
        _ => trimmed.to_string(),
    }
}

/// Classic cron numbers weekdays 0-7 with Sunday as both 0 and 7. The cron
/// crate numbers them 1-7 starting at Sunday.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(normalize_day_of_week_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_day_of_week_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };

    let bounds = match range.split_once('-') {
        _ if range == "*" => step.map(|_| (0, 6)),
        Some((start, end)) => start.parse::<u32>().ok().zip(end.parse::<u32>().ok()),
        // `5/2` steps from the given day to the end of the week
        None => range
            .parse::<u32>()
            .ok()
            .map(|day| (day, if step.is_some() { 6 } else { day })),
    };
    // Names, plain `*` and malformed values are left to the parser
    let Some((start, end)) = bounds.filter(|(start, end)| start <= end && *end <= 7) else {
        return item.to_string();
    };
    let step = match step.map(str::parse::<usize>) {
        None => 1,
        Some(Ok(step)) if step > 0 => step,
        Some(_) => return item.to_string(),
    };

    if step == 1 && end < 7 {
        return if start == end {
            (start + 1).to_string()
        } else {
            format!("{}-{}", start + 1, end + 1)
        };
    }

    // Stepped ranges and ranges ending on a trailing Sunday are listed out
    let mut days: Vec<u32> = (start..=end).step_by(step).map(|day| day % 7 + 1).collect();
    days.sort_unstable();
    days.dedup();
    days.iter()
        .map(|day| day.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Weekday};
    use proptest::prelude::*;

    #[test]
    fn test_parse_valid_cron_expression() {
        assert!(parse_cron_expression("0 0 12 * * * *").is_ok());
        assert!(parse_cron_expression("* * * * *").is_ok());
        assert!(parse_cron_expression("*/5 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        assert!(parse_cron_expression("invalid").is_err());
        assert!(parse_cron_expression("").is_err());
        assert!(parse_cron_expression("61 * * * *").is_err());
    }

    #[test]
    fn test_every_minute_fires_on_next_minute_boundary() {
        let evaluator = CronExpressionEvaluator::default();
        // 2024-01-01T00:00:30Z
        let from = 1_704_067_230;
        let next = evaluator.next_fire_after("* * * * *", from).unwrap();
        assert_eq!(next, 1_704_067_260);
    }

    #[test]
    fn test_next_fire_is_strictly_after_boundary() {
        let evaluator = CronExpressionEvaluator::default();
        // Exactly on a minute boundary
        let from = 1_704_067_260;
        let next = evaluator.next_fire_after("* * * * *", from).unwrap();
        assert_eq!(next, from + 60);
    }

    #[test]
    fn test_timezone_shifts_daily_schedule() {
        let utc = CronExpressionEvaluator::default();
        let berlin = CronExpressionEvaluator::with_timezone_name("Europe/Berlin").unwrap();
        // 2024-01-01T00:00:00Z, Berlin is UTC+1 in winter
        let from = 1_704_067_200;
        let utc_noon = utc.next_fire_after("0 12 * * *", from).unwrap();
        let berlin_noon = berlin.next_fire_after("0 12 * * *", from).unwrap();
        assert_eq!(utc_noon - berlin_noon, 3600);
    }

    #[test]
    fn test_invalid_timezone() {
        assert!(matches!(
            CronExpressionEvaluator::with_timezone_name("Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    fn weekday_of(timestamp: Timestamp) -> Weekday {
        Utc.timestamp_opt(timestamp, 0).single().unwrap().weekday()
    }

    #[test]
    fn test_day_of_week_renumbering() {
        assert_eq!(normalize_day_of_week("0"), "1");
        assert_eq!(normalize_day_of_week("7"), "1");
        assert_eq!(normalize_day_of_week("1-5"), "2-6");
        assert_eq!(normalize_day_of_week("0,6"), "1,7");
        assert_eq!(normalize_day_of_week("5-7"), "1,6,7");
        assert_eq!(normalize_day_of_week("*/2"), "1,3,5,7");
        assert_eq!(normalize_day_of_week("*"), "*");
        assert_eq!(normalize_day_of_week("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn test_native_six_field_form_is_untouched() {
        assert_eq!(normalize_expression("0 0 9 * * 2"), "0 0 9 * * 2");
        assert_eq!(normalize_expression("0 9 * * 1"), "0 0 9 * * 2");
    }

    #[test]
    fn test_sunday_as_zero_is_valid() {
        let evaluator = CronExpressionEvaluator::default();
        assert!(evaluator.validate("0 0 * * 0"));
        assert!(evaluator.validate("0 0 * * 7"));

        // 2024-01-01T00:00:00Z is a Monday
        let from = 1_704_067_200;
        let sunday = evaluator.next_fire_after("0 0 * * 0", from).unwrap();
        assert_eq!(weekday_of(sunday), Weekday::Sun);
        assert_eq!(sunday, from + 6 * 86_400);
        assert_eq!(evaluator.next_fire_after("0 0 * * 7", from).unwrap(), sunday);
    }

    #[test]
    fn test_monday_expression_fires_on_monday() {
        let evaluator = CronExpressionEvaluator::default();
        // Wednesday 2024-01-03T00:00:00Z
        let from = 1_704_240_000;
        let next = evaluator.next_fire_after("0 9 * * 1", from).unwrap();
        assert_eq!(weekday_of(next), Weekday::Mon);
        // Monday 2024-01-08T09:00:00Z
        assert_eq!(next, 1_704_704_400);
    }

    #[test]
    fn test_weekday_range_skips_weekend() {
        let evaluator = CronExpressionEvaluator::default();
        let mut from = 1_704_067_200;
        let mut seen = Vec::new();
        for _ in 0..10 {
            from = evaluator.next_fire_after("0 9 * * 1-5", from).unwrap();
            seen.push(weekday_of(from));
        }
        assert!(!seen.contains(&Weekday::Sat));
        assert!(!seen.contains(&Weekday::Sun));
        assert_eq!(seen[0], Weekday::Mon);
    }

    proptest! {
        #[test]
        fn prop_next_fire_is_after_reference(from in 0i64..4_000_000_000i64) {
            let evaluator = CronExpressionEvaluator::default();
            let next = evaluator.next_fire_after("*/5 * * * *", from).unwrap();
            prop_assert!(next > from);
            prop_assert!(next - from <= 300);
            prop_assert_eq!(next % 300, 0);
        }
    }
}
