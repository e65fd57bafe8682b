use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::str::FromStr;

/// Parse a cron expression.
///
/// Accepts the `cron` crate's 6/7-field form (with seconds) and the classic
/// 5-field form, which fires at second 0.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("cron expression is empty".to_string()));
    }
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::InvalidInput(format!("invalid cron expression '{expr}': {e}")))
}

/// Fire times in `(mark, now]`, oldest first, keeping only the newest `limit`.
pub fn due_times(
    schedule: &cron::Schedule,
    mark: DateTime<Utc>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    let limit = limit.max(1);
    let mut due = VecDeque::with_capacity(limit);
    for t in schedule.after(&mark).take_while(|t| *t <= now) {
        if due.len() == limit {
            due.pop_front();
        }
        due.push_back(t);
    }
    due.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        let s = parse_schedule("*/15 * * * *").unwrap();
        let next = s.after(&at(10, 1)).next().unwrap();
        assert_eq!(next, at(10, 15));
        assert!(parse_schedule("0 */15 * * * *").is_ok());
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("every minute").is_err());
    }

    #[test]
    fn due_times_are_bounded_by_mark_and_now() {
        let s = parse_schedule("*/15 * * * *").unwrap();
        let due = due_times(&s, at(10, 0), at(11, 0), 10);
        assert_eq!(due, vec![at(10, 15), at(10, 30), at(10, 45), at(11, 0)]);
        assert!(due_times(&s, at(10, 0), at(10, 14), 10).is_empty());
    }

    #[test]
    fn due_times_keep_the_newest_when_capped() {
        let s = parse_schedule("*/15 * * * *").unwrap();
        let due = due_times(&s, at(10, 0), at(11, 0), 2);
        assert_eq!(due, vec![at(10, 45), at(11, 0)]);
    }
}
