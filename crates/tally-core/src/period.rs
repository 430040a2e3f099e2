//! Period resolution: reference date + schedule → normalized snapshot date
//! and the query window for period-scoped source queries.
//!
//! Every schedule anchors to the first day of the month containing the
//! reference date; the schedule only changes the label stored on the
//! snapshot.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::{Error, Result};

/// Format used for window bounds handed to source queries.
pub const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ─── Schedule ────────────────────────────────────────────────────────────────

/// The capture schedule recorded as a snapshot's `snapshot_type`.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  AsRefStr,
  Display,
  EnumIter,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Schedule {
  Monthly,
  Quarterly,
  Annually,
  Daily,
  Manual,
  Specific,
}

impl Schedule {
  /// Parse a caller-supplied schedule tag, naming the bad value on failure.
  pub fn parse(raw: &str) -> Result<Self> {
    Self::from_str(raw.trim())
      .map_err(|_| Error::invalid(format!("Invalid snapshot_type: {raw:?}")))
  }
}

// ─── Date parsing ────────────────────────────────────────────────────────────

/// Parse a strict `YYYY-MM-DD` calendar date.
///
/// Shape violations fail with `Invalid <field> format`. Well-formed strings
/// that do not name a real day (`2026-02-30`) fail with `Invalid <field>`
/// instead of rolling over into the following month.
pub fn parse_calendar_date(field: &str, raw: &str) -> Result<NaiveDate> {
  let format_error =
    || Error::invalid(format!("Invalid {field} format: {raw:?} (expected YYYY-MM-DD)"));

  let bytes = raw.as_bytes();
  let well_formed = bytes.len() == 10
    && bytes.iter().enumerate().all(|(i, b)| match i {
      4 | 7 => *b == b'-',
      _ => b.is_ascii_digit(),
    });
  if !well_formed {
    return Err(format_error());
  }

  let year: i32 = raw[0..4].parse().map_err(|_| format_error())?;
  let month: u32 = raw[5..7].parse().map_err(|_| format_error())?;
  let day: u32 = raw[8..10].parse().map_err(|_| format_error())?;

  let date = NaiveDate::from_ymd_opt(year, month, day)
    .ok_or_else(|| Error::invalid(format!("Invalid {field}: {raw:?} is not a calendar date")))?;

  // Guard against any representation drift: the parsed date must print back
  // to exactly what the caller wrote.
  if date.format("%Y-%m-%d").to_string() != raw {
    return Err(Error::invalid(format!(
      "Invalid {field}: {raw:?} resolves to {date}"
    )));
  }

  Ok(date)
}

/// Local timestamp layouts a reference date may carry after its date part.
const REFERENCE_TIME_FORMATS: &[&str] = &[
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%d %H:%M:%S%.f",
  "%Y-%m-%dT%H:%M",
  "%Y-%m-%d %H:%M",
];

/// Parse a reference date, tolerating a trailing time component
/// (`2025-06-14T08:00:00Z`, `2025-06-14 08:00`). The time must itself be
/// well formed; only the calendar date is kept.
pub fn parse_reference_date(field: &str, raw: &str) -> Result<NaiveDate> {
  let trimmed = raw.trim();
  let Some((date_part, _)) = trimmed.split_once(['T', ' ']) else {
    return parse_calendar_date(field, trimmed);
  };
  let date = parse_calendar_date(field, date_part)?;

  let well_formed = DateTime::parse_from_rfc3339(trimmed).is_ok()
    || REFERENCE_TIME_FORMATS
      .iter()
      .any(|layout| NaiveDateTime::parse_from_str(trimmed, layout).is_ok());
  if !well_formed {
    return Err(Error::invalid(format!(
      "Invalid {field} format: {raw:?} (expected YYYY-MM-DD with an optional time)"
    )));
  }
  Ok(date)
}

/// The first day of the month containing `date`.
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
  date - Days::new(u64::from(date.day0()))
}

// ─── Period ──────────────────────────────────────────────────────────────────

/// A resolved reporting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
  pub schedule:      Schedule,
  /// Always the first day of the month.
  pub snapshot_date: NaiveDate,
  /// `snapshot_date` at 00:00:00.
  pub start:         NaiveDateTime,
  /// Last day of the month at 23:59:59.
  pub end:           NaiveDateTime,
}

impl Period {
  /// The period of the month containing `date`.
  pub fn containing(schedule: Schedule, date: NaiveDate) -> Self {
    let snapshot_date = first_of_month(date);
    let start = snapshot_date.and_time(NaiveTime::MIN);
    let end = (snapshot_date + Months::new(1)).and_time(NaiveTime::MIN)
      - Duration::seconds(1);
    Self { schedule, snapshot_date, start, end }
  }

  /// Resolve a period from an optional reference date string; `today` is
  /// used when no reference is given.
  pub fn resolve(
    schedule: Schedule,
    reference: Option<&str>,
    today: NaiveDate,
  ) -> Result<Self> {
    let date = match reference.map(str::trim).filter(|r| !r.is_empty()) {
      Some(raw) => parse_reference_date("reference_date", raw)?,
      None => today,
    };
    Ok(Self::containing(schedule, date))
  }

  /// Window start formatted for binding into a source query.
  pub fn start_text(&self) -> String { self.start.format(WINDOW_FORMAT).to_string() }

  /// Window end formatted for binding into a source query.
  pub fn end_text(&self) -> String { self.end.format(WINDOW_FORMAT).to_string() }
}
