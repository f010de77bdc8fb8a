//! Resolution of `--from`/`--to` date specifiers into a half-open UTC day
//! interval restricting which days' logs are read.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// The wall-clock format used uniformly by the analysis logs and the
/// human-readable report output.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// A half-open UTC interval `[from, to)`, both ends on day boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Window {
    /// Resolve the `--from`/`--to` option strings against the invocation
    /// clock. An absent `to` means now. The resolved `to` is advanced one
    /// day and truncated so the interval is exclusive on the right.
    pub fn resolve(from: &str, to: Option<&str>, now: DateTime<Utc>) -> Result<Self> {
        let from = parse_time_spec(from, now)?;
        let to = match to {
            Some(spec) => parse_time_spec(spec, now)?,
            None => now,
        };
        let to = midnight(to + Duration::days(1));
        Ok(Self { from, to })
    }
}

/// Parse one date specifier: `YYYY-MM-DD` (that day at UTC midnight),
/// `Nd` (N days ago), or `Nw` (N weeks ago), relative specs truncated to
/// their UTC day.
pub fn parse_time_spec(spec: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(spec, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    if let Some(days) = spec.strip_suffix('d').and_then(|n| n.parse::<u32>().ok()) {
        return Ok(midnight(now - Duration::days(i64::from(days))));
    }
    if let Some(weeks) = spec.strip_suffix('w').and_then(|n| n.parse::<u32>().ok()) {
        return Ok(midnight(now - Duration::days(7 * i64::from(weeks))));
    }
    bail!("invalid time specification {spec:?}: expected YYYY-MM-DD, Nd, or Nw");
}

/// Truncate to UTC midnight of the same day.
pub fn midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}
