//! Trigger engine: next fire time for one-shot, interval and cron triggers.
//!
//! Cron expressions are matched against local wall-clock time in the job's
//! timezone. Daylight-saving transitions are resolved as follows:
//!
//! | Transition          | Behaviour                                                   |
//! |---------------------|-------------------------------------------------------------|
//! | Gap (spring fwd)    | Fire once at the first valid local instant after the gap    |
//! | Overlap (fall back) | Fire once, at the earliest instant after the reference time |
//!
//! All functions here are pure; the reference time is always passed in.

use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};
use crate::types::Trigger;

/// Longest DST gap we probe across (real-world gaps are 30 or 60 minutes).
const MAX_GAP_MINUTES: i64 = 3 * 60;
/// Calendar candidates examined before giving up on a cron expression.
const MAX_CANDIDATES: usize = 16;

/// Compute the next fire time strictly after `reference`.
///
/// Returns `Ok(None)` when nothing is left to fire: a one-shot whose instant
/// has passed, or a cron expression with no future match.
pub fn compute_next_fire(
    trigger: &Trigger,
    reference: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        Trigger::OneShot { at } => Ok((*at > reference).then_some(*at)),

        Trigger::Interval { every_secs, start } => {
            let every_ms = interval_millis(*every_secs)?;
            if reference < *start {
                return Ok(Some(*start));
            }
            // Smallest start + k·every strictly after reference; k is derived
            // from elapsed time so missed ticks are never replayed.
            let elapsed_ms = (reference - *start).num_milliseconds();
            let k = elapsed_ms / every_ms + 1;
            let next = k
                .checked_mul(every_ms)
                .and_then(|ms| start.checked_add_signed(Duration::milliseconds(ms)));
            Ok(next)
        }

        Trigger::Cron {
            expression,
            timezone,
        } => {
            let schedule = parse_cron(expression)?;
            let tz = parse_timezone(timezone)?;
            Ok(next_cron_fire(&schedule, tz, reference))
        }
    }
}

/// Reject malformed triggers at creation time so they can never fail at fire time.
pub fn validate(trigger: &Trigger, now: DateTime<Utc>) -> Result<()> {
    match trigger {
        Trigger::OneShot { .. } => Ok(()),
        Trigger::Interval { every_secs, .. } => interval_millis(*every_secs).map(|_| ()),
        Trigger::Cron { expression, .. } => match compute_next_fire(trigger, now)? {
            Some(_) => Ok(()),
            None => Err(SchedulerError::InvalidTrigger(format!(
                "cron expression '{expression}' has no future occurrences"
            ))),
        },
    }
}

fn interval_millis(every_secs: u64) -> Result<i64> {
    if every_secs == 0 {
        return Err(SchedulerError::InvalidTrigger(
            "interval must be at least one second".to_string(),
        ));
    }
    i64::try_from(every_secs)
        .ok()
        .and_then(|s| s.checked_mul(1000))
        .ok_or_else(|| SchedulerError::InvalidTrigger(format!("interval too large: {every_secs}s")))
}

/// Parse a cron expression.
///
/// Five fields are read as a standard crontab line: a seconds field of `0`
/// is prepended and numeric days of the week use crontab numbering
/// (`0` or `7` = Sunday, `1` = Monday). Six or seven fields go to the `cron`
/// crate unchanged, where `1` = Sunday.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.is_empty() {
        return Err(SchedulerError::InvalidTrigger(
            "cron expression is empty".to_string(),
        ));
    }
    let normalized = if fields.len() == 5 {
        let day_of_week = crontab_day_of_week(fields[4]).map_err(|reason| {
            SchedulerError::InvalidTrigger(format!(
                "invalid cron expression '{expression}': {reason}"
            ))
        })?;
        format!("0 {} {day_of_week}", fields[..4].join(" "))
    } else {
        fields.join(" ")
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        SchedulerError::InvalidTrigger(format!("invalid cron expression '{expression}': {e}"))
    })
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a crontab day-of-week field into day names, which the `cron`
/// crate reads the same way crontab does. Items that are already names are
/// kept as written.
fn crontab_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut named = Vec::new();
    let mut days = std::collections::BTreeSet::new();
    for item in field.split(',') {
        let range_part = item.split('/').next().unwrap_or(item);
        if range_part != "*" && !range_part.chars().any(|c| c.is_ascii_digit()) {
            named.push(item.to_string());
            continue;
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step '{item}'"))?;
                if step == 0 {
                    return Err(format!("day-of-week step must be positive: '{item}'"));
                }
                (range, Some(step))
            }
            None => (item, None),
        };
        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (day_number(lo)?, day_number(hi)?)
        } else {
            let n = day_number(range)?;
            // `N/S` runs from N to the end of the week.
            (n, if step.is_some() { 6 } else { n })
        };
        if lo > hi {
            return Err(format!("day-of-week range out of order: '{item}'"));
        }
        for day in (lo..=hi).step_by(step.unwrap_or(1)) {
            days.insert(day % 7);
        }
    }
    named.extend(days.into_iter().map(|d| DAY_NAMES[d].to_string()));
    Ok(named.join(","))
}

fn day_number(s: &str) -> std::result::Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(n),
        _ => Err(format!("day of week must be 0-7, got '{s}'")),
    }
}

pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTrigger(format!("unknown timezone: {timezone}")))
}

fn next_cron_fire(
    schedule: &cron::Schedule,
    tz: Tz,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // Walk the calendar in naive local time (evaluated as UTC so the cron
    // crate sees no offset changes), then map each match back to an instant.
    let mut cursor = reference.with_timezone(&tz).naive_local();

    for _ in 0..MAX_CANDIDATES {
        let candidate = schedule
            .after(&Utc.from_utc_datetime(&cursor))
            .next()?
            .naive_utc();
        if candidate <= cursor {
            cursor += Duration::seconds(1);
            continue;
        }

        let instant = match tz.from_local_datetime(&candidate) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)).filter(|t| *t > reference),
            LocalResult::Ambiguous(earliest, latest) => [earliest, latest]
                .into_iter()
                .map(|t| t.with_timezone(&Utc))
                .find(|t| *t > reference),
            LocalResult::None => first_instant_after_gap(tz, candidate).filter(|t| *t > reference),
        };
        if instant.is_some() {
            return instant;
        }
        cursor = candidate;
    }
    None
}

/// First valid local instant after a spring-forward gap containing `local`.
fn first_instant_after_gap(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let base = local.with_second(0)?.with_nanosecond(0)?;
    (1..=MAX_GAP_MINUTES)
        .map(|m| base + Duration::minutes(m))
        .find_map(|probe| tz.from_local_datetime(&probe).earliest())
        .map(|t| t.with_timezone(&Utc))
}
