//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings, calendar dates as `YYYY-MM-DD`,
//! enums as their snake_case names and UUIDs as hyphenated lowercase strings.
//! KPI values and metadata are stored as compact JSON.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value;
use tally_core::{
  kpi::KpiMetric,
  period::Schedule,
  snapshot::{Snapshot, Source},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Decode(format!("timestamp {s:?}: {e}")))
}

// ─── NaiveDate ───────────────────────────────────────────────────────────────

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::Decode(format!("date {s:?}: {e}")))
}

// ─── Enums ───────────────────────────────────────────────────────────────────

pub fn decode_schedule(s: &str) -> Result<Schedule> {
  Schedule::from_str(s).map_err(|_| Error::Decode(format!("unknown snapshot type: {s:?}")))
}

pub fn decode_source(s: &str) -> Result<Source> {
  Source::from_str(s).map_err(|_| Error::Decode(format!("unknown source: {s:?}")))
}

// ─── Source rows ─────────────────────────────────────────────────────────────

/// Convert a SQLite value from an operational query into JSON.
pub fn sql_to_json(value: ValueRef<'_>) -> Value {
  match value {
    ValueRef::Null => Value::Null,
    ValueRef::Integer(i) => Value::from(i),
    ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
      Value::String(String::from_utf8_lossy(bytes).into_owned())
    }
  }
}

/// A fact label as a bindable SQL value.
pub fn encode_label(label: Option<&str>) -> SqlValue {
  label.map_or(SqlValue::Null, |l| SqlValue::Text(l.to_owned()))
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from a `snapshots` row.
pub struct RawSnapshot {
  pub snapshot_id:   String,
  pub definition:    String,
  pub snapshot_type: String,
  pub snapshot_date: String,
  pub source:        String,
  pub is_test:       bool,
  pub created_at:    String,
}

/// Columns selected for a [`RawSnapshot`], in [`RawSnapshot::from_row`] order.
pub const SNAPSHOT_COLUMNS: &str =
  "snapshot_id, definition, snapshot_type, snapshot_date, source, is_test, created_at";

impl RawSnapshot {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      snapshot_id:   row.get(0)?,
      definition:    row.get(1)?,
      snapshot_type: row.get(2)?,
      snapshot_date: row.get(3)?,
      source:        row.get(4)?,
      is_test:       row.get(5)?,
      created_at:    row.get(6)?,
    })
  }

  pub fn into_snapshot(self) -> Result<Snapshot> {
    Ok(Snapshot {
      snapshot_id:   decode_uuid(&self.snapshot_id)?,
      definition:    self.definition,
      snapshot_type: decode_schedule(&self.snapshot_type)?,
      snapshot_date: decode_date(&self.snapshot_date)?,
      source:        decode_source(&self.source)?,
      is_test:       self.is_test,
      created_at:    decode_dt(&self.created_at)?,
    })
  }
}

/// Raw strings read directly from a `kpi_metrics` row.
pub struct RawKpi {
  pub snapshot_id:  String,
  pub kpi_id:       String,
  pub value_json:   String,
  pub period_year:  i32,
  pub period_month: u32,
  pub meta_json:    Option<String>,
}

impl RawKpi {
  pub fn into_metric(self) -> Result<KpiMetric> {
    Ok(KpiMetric {
      snapshot_id:  decode_uuid(&self.snapshot_id)?,
      kpi_id:       self.kpi_id,
      value:        serde_json::from_str(&self.value_json)?,
      period_year:  self.period_year,
      period_month: self.period_month,
      meta:         self.meta_json.as_deref().map(serde_json::from_str).transpose()?,
    })
  }
}
