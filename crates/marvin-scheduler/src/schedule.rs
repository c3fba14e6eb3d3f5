//! Fire-instant computation for every schedule kind.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;

use crate::types::Schedule;

/// Smallest `anchor + k * every` (whole `k >= 0`) that is at or after
/// `now`. Used at creation and startup.
pub fn every_fire_at_or_after(anchor_ms: i64, every_ms: i64, now_ms: i64) -> i64 {
    if now_ms <= anchor_ms {
        return anchor_ms;
    }
    let elapsed = now_ms - anchor_ms;
    let k = (elapsed + every_ms - 1) / every_ms;
    anchor_ms + k * every_ms
}

/// Smallest `anchor + k * every` strictly after `now`. Used when
/// rescheduling after a run so the instant just fired is never reused.
pub fn every_fire_after(anchor_ms: i64, every_ms: i64, now_ms: i64) -> i64 {
    if now_ms < anchor_ms {
        return anchor_ms;
    }
    let k = (now_ms - anchor_ms) / every_ms + 1;
    anchor_ms + k * every_ms
}

/// The `cron` crate expects a seconds field first; standard 5-field
/// expressions get zero seconds prepended. 6/7-field input passes
/// through untouched.
fn normalize_cron_expr(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Next fire instant strictly after `from_ms` for `(expr, timezone)`.
///
/// The expression is evaluated as wall-clock time in the named IANA
/// zone. Errors are returned as plain strings because they end up
/// recorded on the job rather than propagated.
pub fn next_cron_fire(expr: &str, timezone: &str, from_ms: i64) -> std::result::Result<i64, String> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| format!("unknown timezone '{timezone}'"))?;
    let schedule = cron::Schedule::from_str(&normalize_cron_expr(expr))
        .map_err(|e| format!("invalid cron expression '{expr}': {e}"))?;
    let from = Utc
        .timestamp_millis_opt(from_ms)
        .single()
        .ok_or_else(|| format!("reference instant {from_ms} out of range"))?;
    schedule
        .after(&from.with_timezone(&tz))
        .next()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| format!("cron expression '{expr}' has no upcoming fire time"))
}

/// Initial `next_run_at_ms` for a newly created or re-enabled job.
/// Cron jobs report 0 here; their instant is filled in when the cron
/// handle is armed.
pub fn initial_next_run(schedule: &Schedule, now_ms: i64) -> i64 {
    match schedule {
        Schedule::At { at_ms } => *at_ms,
        Schedule::Every { every_ms, anchor_ms } => {
            every_fire_at_or_after(*anchor_ms, *every_ms, now_ms)
        }
        Schedule::Cron { .. } => 0,
    }
}
