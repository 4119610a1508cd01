//! Standard 5-field cron expression parsing and evaluation.
//!
//! Fields are `minute hour day-of-month month day-of-week`, supporting `*`,
//! lists (`1,15,30`), ranges (`9-17`), and steps (`*/5`, `10-40/10`).
//! Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday. When both
//! day-of-month and day-of-week are restricted, the expression fires when
//! *either* matches (classic cron OR semantics). Evaluation is UTC-only and
//! always lands on a minute boundary.

use crate::error::ScheduleError;

use std::fmt;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};

/// A parsed cron expression.
///
/// Construction via [`CronExpr::parse`] validates the expression up front;
/// a `CronExpr` that exists is always evaluable.
#[derive(Clone)]
pub struct CronExpr {
  source: String,
  minutes: u64,
  hours: u32,
  days_of_month: u32,
  months: u16,
  days_of_week: u8,
  // Per classic cron, a field written as `*` (or `*/step`) is unrestricted;
  // the dom/dow OR rule only applies when both are restricted.
  dom_restricted: bool,
  dow_restricted: bool,
}

impl CronExpr {
  /// Parses a standard 5-field cron expression.
  pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidCron {
      expr: expr.to_string(),
      reason,
    };

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
      return Err(invalid(format!(
        "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
        fields.len()
      )));
    }

    let minutes = parse_field(fields[0], 0, 59).map_err(|e| invalid(format!("minute: {e}")))?;
    let hours = parse_field(fields[1], 0, 23).map_err(|e| invalid(format!("hour: {e}")))?;
    let days_of_month =
      parse_field(fields[2], 1, 31).map_err(|e| invalid(format!("day-of-month: {e}")))?;
    let months = parse_field(fields[3], 1, 12).map_err(|e| invalid(format!("month: {e}")))?;
    let mut days_of_week =
      parse_field(fields[4], 0, 7).map_err(|e| invalid(format!("day-of-week: {e}")))?;

    // Fold 7 (Sunday) onto 0.
    if days_of_week & (1 << 7) != 0 {
      days_of_week = (days_of_week & !(1 << 7)) | 1;
    }

    Ok(Self {
      source: expr.to_string(),
      minutes,
      hours: hours as u32,
      days_of_month: days_of_month as u32,
      months: months as u16,
      days_of_week: days_of_week as u8,
      dom_restricted: !fields[2].starts_with('*'),
      dow_restricted: !fields[4].starts_with('*'),
    })
  }

  /// The original expression text.
  pub fn source(&self) -> &str {
    &self.source
  }

  /// The smallest matching minute boundary strictly after `after`.
  ///
  /// Returns `None` only if no match exists within an eight-year horizon
  /// (e.g. `0 0 30 2 *`, which never fires).
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // Round down to the minute, then step forward one minute so the result
    // is strictly after `after`.
    let mut t = Utc
      .with_ymd_and_hms(
        after.year(),
        after.month(),
        after.day(),
        after.hour(),
        after.minute(),
        0,
      )
      .single()?
      + ChronoDuration::minutes(1);
    let horizon = after + ChronoDuration::days(366 * 8);

    while t <= horizon {
      if self.months & (1 << t.month()) == 0 {
        t = start_of_next_month(t)?;
        continue;
      }
      if !self.day_matches(&t) {
        t = start_of_next_day(t)?;
        continue;
      }
      if self.hours & (1 << t.hour()) == 0 {
        t = start_of_next_hour(t)?;
        continue;
      }
      if self.minutes & (1 << t.minute()) == 0 {
        t += ChronoDuration::minutes(1);
        continue;
      }
      return Some(t);
    }
    None
  }

  fn day_matches(&self, t: &DateTime<Utc>) -> bool {
    let dom_ok = self.days_of_month & (1 << t.day()) != 0;
    let dow_ok = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;
    match (self.dom_restricted, self.dow_restricted) {
      (true, true) => dom_ok || dow_ok,
      (true, false) => dom_ok,
      (false, true) => dow_ok,
      (false, false) => true,
    }
  }
}

impl fmt::Debug for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("CronExpr").field(&self.source).finish()
  }
}

impl fmt::Display for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

impl PartialEq for CronExpr {
  fn eq(&self, other: &Self) -> bool {
    self.source == other.source
  }
}

impl Eq for CronExpr {}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let next = t.date_naive().succ_opt()?;
  Utc
    .with_ymd_and_hms(next.year(), next.month(), next.day(), 0, 0, 0)
    .single()
}

fn start_of_next_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
  Some(
    Utc
      .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
      .single()?
      + ChronoDuration::hours(1),
  )
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let (year, month) = if t.month() == 12 {
    (t.year() + 1, 1)
  } else {
    (t.year(), t.month() + 1)
  };
  Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Parses one cron field into a bitmask over `[min, max]`.
fn parse_field(field: &str, min: u8, max: u8) -> Result<u64, String> {
  if field.is_empty() {
    return Err("empty field".to_string());
  }
  let mut mask: u64 = 0;
  for part in field.split(',') {
    mask |= parse_part(part, min, max)?;
  }
  Ok(mask)
}

/// Parses a single list element: `*`, `N`, `A-B`, each optionally with `/step`.
fn parse_part(part: &str, min: u8, max: u8) -> Result<u64, String> {
  let (range, step) = match part.split_once('/') {
    Some((range, step_str)) => {
      let step: u8 = step_str
        .parse()
        .map_err(|_| format!("invalid step '{step_str}'"))?;
      if step == 0 {
        return Err("step must be greater than zero".to_string());
      }
      (range, step)
    }
    None => (part, 1),
  };

  let (lo, hi) = if range == "*" {
    (min, max)
  } else {
    match range.split_once('-') {
      Some((a, b)) => {
        let lo = parse_value(a, min, max)?;
        let hi = parse_value(b, min, max)?;
        if lo > hi {
          return Err(format!("range '{range}' is inverted"));
        }
        (lo, hi)
      }
      None => {
        let v = parse_value(range, min, max)?;
        if step != 1 {
          // `N/step` means "from N to max by step", per common cron dialects.
          (v, max)
        } else {
          (v, v)
        }
      }
    }
  };

  let mut mask: u64 = 0;
  let mut v = lo;
  while v <= hi {
    mask |= 1 << v;
    match v.checked_add(step) {
      Some(next) => v = next,
      None => break,
    }
  }
  Ok(mask)
}

fn parse_value(s: &str, min: u8, max: u8) -> Result<u8, String> {
  let v: u8 = s.parse().map_err(|_| format!("invalid value '{s}'"))?;
  if v < min || v > max {
    return Err(format!("value {v} out of range {min}-{max}"));
  }
  Ok(v)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
  }

  #[test]
  fn every_minute_returns_next_minute_boundary() {
    let expr = CronExpr::parse("* * * * *").unwrap();
    let next = expr.next_after(at(2024, 3, 10, 12, 30, 17)).unwrap();
    assert_eq!(next, at(2024, 3, 10, 12, 31, 0));

    // Exactly on a boundary still moves strictly forward.
    let next = expr.next_after(at(2024, 3, 10, 12, 30, 0)).unwrap();
    assert_eq!(next, at(2024, 3, 10, 12, 31, 0));
  }

  #[test]
  fn daily_midnight_returns_next_midnight() {
    let expr = CronExpr::parse("0 0 * * *").unwrap();
    let next = expr.next_after(at(2024, 3, 10, 12, 30, 0)).unwrap();
    assert_eq!(next, at(2024, 3, 11, 0, 0, 0));

    // Midnight itself yields the following midnight.
    let next = expr.next_after(at(2024, 3, 10, 0, 0, 0)).unwrap();
    assert_eq!(next, at(2024, 3, 11, 0, 0, 0));
  }

  #[test]
  fn lists_ranges_and_steps() {
    let expr = CronExpr::parse("0,30 9-17 * * *").unwrap();
    assert_eq!(
      expr.next_after(at(2024, 3, 10, 9, 0, 0)).unwrap(),
      at(2024, 3, 10, 9, 30, 0)
    );
    assert_eq!(
      expr.next_after(at(2024, 3, 10, 17, 30, 0)).unwrap(),
      at(2024, 3, 11, 9, 0, 0)
    );

    let expr = CronExpr::parse("*/15 * * * *").unwrap();
    assert_eq!(
      expr.next_after(at(2024, 3, 10, 9, 16, 0)).unwrap(),
      at(2024, 3, 10, 9, 30, 0)
    );

    let expr = CronExpr::parse("10-40/10 * * * *").unwrap();
    assert_eq!(
      expr.next_after(at(2024, 3, 10, 9, 35, 0)).unwrap(),
      at(2024, 3, 10, 9, 40, 0)
    );
    assert_eq!(
      expr.next_after(at(2024, 3, 10, 9, 40, 0)).unwrap(),
      at(2024, 3, 10, 10, 10, 0)
    );
  }

  #[test]
  fn dom_dow_or_semantics() {
    // Fires on the 13th of the month OR on Fridays.
    let expr = CronExpr::parse("0 0 13 * 5").unwrap();
    // 2024-09-10 is a Tuesday; the next Friday is the 13th.
    assert_eq!(
      expr.next_after(at(2024, 9, 10, 0, 0, 0)).unwrap(),
      at(2024, 9, 13, 0, 0, 0)
    );
    // After Fri Sep 13, the next match is Fri Sep 20 (dow), before Oct 13 (dom).
    assert_eq!(
      expr.next_after(at(2024, 9, 13, 0, 0, 0)).unwrap(),
      at(2024, 9, 20, 0, 0, 0)
    );
  }

  #[test]
  fn unrestricted_dow_uses_dom_only() {
    let expr = CronExpr::parse("0 0 15 * *").unwrap();
    assert_eq!(
      expr.next_after(at(2024, 3, 10, 0, 0, 0)).unwrap(),
      at(2024, 3, 15, 0, 0, 0)
    );
  }

  #[test]
  fn sunday_as_seven() {
    let expr = CronExpr::parse("0 12 * * 7").unwrap();
    // 2024-03-10 is a Sunday.
    assert_eq!(
      expr.next_after(at(2024, 3, 10, 0, 0, 0)).unwrap(),
      at(2024, 3, 10, 12, 0, 0)
    );
  }

  #[test]
  fn month_rollover_and_leap_day() {
    let expr = CronExpr::parse("30 4 1 1 *").unwrap();
    assert_eq!(
      expr.next_after(at(2024, 6, 1, 0, 0, 0)).unwrap(),
      at(2025, 1, 1, 4, 30, 0)
    );

    let expr = CronExpr::parse("0 0 29 2 *").unwrap();
    assert_eq!(
      expr.next_after(at(2024, 3, 1, 0, 0, 0)).unwrap(),
      at(2028, 2, 29, 0, 0, 0)
    );
  }

  #[test]
  fn never_matching_expression_returns_none() {
    let expr = CronExpr::parse("0 0 30 2 *").unwrap();
    assert!(expr.next_after(at(2024, 1, 1, 0, 0, 0)).is_none());
  }

  #[test]
  fn rejects_malformed_expressions() {
    for bad in [
      "",
      "* * * *",
      "* * * * * *",
      "61 * * * *",
      "* 24 * * *",
      "* * 0 * *",
      "* * * 13 *",
      "* * * * 8",
      "a * * * *",
      "*/0 * * * *",
      "20-10 * * * *",
    ] {
      let err = CronExpr::parse(bad).unwrap_err();
      assert!(
        matches!(err, ScheduleError::InvalidCron { .. }),
        "expected InvalidCron for {bad:?}, got {err:?}"
      );
    }
  }
}
