//! Absolute and human-readable run times.
//!
//! Accepts the phrases callers tend to write when scheduling by hand:
//! `"now"`, `"in 5 minutes"`, `"2 hours ago"`, `"1 hour and 30 minutes"`,
//! `"500ms"`, or an RFC 3339 timestamp.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

use crate::error::ScheduleError;

/// When a scheduled instance should first become eligible to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAt {
  /// A fixed UTC instant. Instants in the past are immediately due.
  At(DateTime<Utc>),
  /// A textual time: RFC 3339, `"now"`, or a relative phrase.
  Expression(String),
}

impl From<DateTime<Utc>> for RunAt {
  fn from(at: DateTime<Utc>) -> Self {
    RunAt::At(at)
  }
}

impl From<&str> for RunAt {
  fn from(expression: &str) -> Self {
    RunAt::Expression(expression.to_string())
  }
}

impl From<String> for RunAt {
  fn from(expression: String) -> Self {
    RunAt::Expression(expression)
  }
}

impl RunAt {
  /// Resolves this value to an absolute instant relative to `now`.
  ///
  /// # Errors
  ///
  /// [`ScheduleError::InvalidRunAt`] if the expression is not understood.
  pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    match self {
      RunAt::At(at) => Ok(*at),
      RunAt::Expression(raw) => {
        resolve_expression(raw, now).ok_or_else(|| ScheduleError::InvalidRunAt(raw.clone()))
      }
    }
  }
}

fn resolve_expression(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let text = raw.trim();
  if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
    return Some(parsed.with_timezone(&Utc));
  }

  let lowered = text.to_ascii_lowercase();
  match lowered.as_str() {
    "now" | "immediately" => return Some(now),
    _ => {}
  }

  if let Some(rest) = lowered.strip_suffix(" ago") {
    let delta = ChronoDuration::from_std(parse_duration_phrase(rest)?).ok()?;
    return now.checked_sub_signed(delta);
  }

  let rest = lowered.strip_prefix("in ").unwrap_or(&lowered);
  let delta = ChronoDuration::from_std(parse_duration_phrase(rest)?).ok()?;
  now.checked_add_signed(delta)
}

/// Parses a human-readable duration such as `"5 minutes"`, `"an hour"`,
/// `"1 hour and 30 minutes"`, `"2h 15m"` or `"1500"` (bare milliseconds).
///
/// Returns `None` for anything it does not recognise.
pub fn parse_duration_phrase(phrase: &str) -> Option<StdDuration> {
  let lowered = phrase.trim().to_ascii_lowercase();
  if lowered.is_empty() {
    return None;
  }
  if let Ok(millis) = lowered.parse::<u64>() {
    return Some(StdDuration::from_millis(millis));
  }

  let cleaned = lowered.replace(',', " ");
  let mut tokens = cleaned
    .split_whitespace()
    .filter(|token| *token != "and")
    .peekable();

  let mut total = StdDuration::ZERO;
  let mut matched_any = false;

  while let Some(token) = tokens.next() {
    let (amount, unit) = match split_compact(token) {
      Some((amount, unit)) => (amount, unit.to_string()),
      None => {
        let amount = parse_amount(token)?;
        let unit = tokens.next()?;
        (amount, unit.to_string())
      }
    };
    let unit_millis = unit_to_millis(&unit)?;
    let millis = amount * unit_millis as f64;
    if !millis.is_finite() || millis < 0.0 {
      warn!(phrase, "Duration phrase produced an invalid amount.");
      return None;
    }
    total = total.checked_add(StdDuration::from_millis(millis.round() as u64))?;
    matched_any = true;
  }

  matched_any.then_some(total)
}

/// Splits tokens like `"5m"` or `"1.5h"` into amount and unit.
fn split_compact(token: &str) -> Option<(f64, &str)> {
  let boundary = token.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
  if boundary == 0 {
    return None;
  }
  let (amount, unit) = token.split_at(boundary);
  Some((amount.parse().ok()?, unit))
}

fn parse_amount(token: &str) -> Option<f64> {
  match token {
    "a" | "an" | "one" => Some(1.0),
    "two" => Some(2.0),
    "three" => Some(3.0),
    "half" => Some(0.5),
    other => other.parse::<f64>().ok(),
  }
}

fn unit_to_millis(unit: &str) -> Option<u64> {
  let millis = match unit {
    "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => 1,
    "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
    "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
    "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000,
    "d" | "day" | "days" => 86_400_000,
    "w" | "wk" | "wks" | "week" | "weeks" => 604_800_000,
    _ => return None,
  };
  Some(millis)
}

/// Adds a std duration to an instant, clamping far into the future on overflow.
pub(crate) fn add_std(base: DateTime<Utc>, delta: StdDuration) -> DateTime<Utc> {
  ChronoDuration::from_std(delta)
    .ok()
    .and_then(|delta| base.checked_add_signed(delta))
    .unwrap_or_else(|| {
      warn!(?delta, "Duration addition overflowed, clamping.");
      base + ChronoDuration::weeks(52 * 100)
    })
}
