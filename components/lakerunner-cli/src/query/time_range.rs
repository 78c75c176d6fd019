// Local crates
use crate::query::query::QueryError;

// External crates
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use regex::Regex;

/// Start expression used when none is given.
pub const DEFAULT_START: &str = "e-1h";
/// End expression used when none is given.
pub const DEFAULT_END: &str = "now";

lazy_static::lazy_static! {
    // `e-1h`, `now-30m`
    static ref RELATIVE_RE: Result<Regex, regex::Error> = Regex::new(r"^(e|now)-(\d+)([smhdw])$");
}

/// Resolved query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Resolve start and end expressions against `now`.
    ///
    /// Accepted forms: `now`, RFC 3339 timestamps, epoch milliseconds, and
    /// `e-<n><unit>` / `now-<n><unit>` offsets where unit is one of `s m h d w`.
    /// `e-` offsets are relative to the resolved end; `now-` to the current time.
    pub fn resolve(
        start: Option<&str>,
        end: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, QueryError> {
        let end_expr = end.filter(|s| !s.trim().is_empty()).unwrap_or(DEFAULT_END);
        let start_expr = start
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_START);

        let end = parse_point(end_expr, now, now)?;
        let start = parse_point(start_expr, end, now)?;

        if start > end {
            return Err(QueryError::InvertedRange {
                start: format_rfc3339(start),
                end: format_rfc3339(end),
            });
        }

        Ok(Self { start, end })
    }

    /// Query parameter pair for the API, in RFC 3339 UTC seconds.
    pub fn to_params(&self) -> (String, String) {
        (format_rfc3339(self.start), format_rfc3339(self.end))
    }
}

fn format_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_point(
    expr: &str,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, QueryError> {
    let expr = expr.trim();
    let invalid = || QueryError::InvalidTime(expr.to_string());

    if expr == "now" {
        return Ok(now);
    }

    if let Ok(re) = RELATIVE_RE.as_ref() {
        if let Some(caps) = re.captures(expr) {
            let amount: i64 = caps[2].parse().map_err(|_| invalid())?;
            let offset = match &caps[3] {
                "s" => Duration::try_seconds(amount),
                "m" => Duration::try_minutes(amount),
                "h" => Duration::try_hours(amount),
                "d" => Duration::try_days(amount),
                "w" => Duration::try_weeks(amount),
                _ => None,
            }
            .ok_or_else(invalid)?;
            let anchor = if &caps[1] == "e" { end } else { now };
            return anchor.checked_sub_signed(offset).ok_or_else(invalid);
        }
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(expr) {
        return Ok(t.with_timezone(&Utc));
    }

    if let Ok(ms) = expr.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms).ok_or_else(invalid);
    }

    Err(invalid())
}
