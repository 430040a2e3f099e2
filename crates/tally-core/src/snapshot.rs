//! Snapshot headers and fact rows.
//!
//! A snapshot is written once and never updated. Corrections are recorded as
//! a new snapshot under a different provenance source, or by deleting the old
//! one explicitly.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::period::Schedule;

// ─── Provenance ──────────────────────────────────────────────────────────────

/// What triggered a capture. Part of the snapshot's uniqueness key, so
/// automated and manual captures of the same period never collide.
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
pub enum Source {
  /// Run by the scheduler.
  Automated,
  /// Entered through an admin form.
  ManualForm,
  /// Loaded from an external import payload.
  ManualImport,
  /// Triggered from the command line.
  ManualCli,
}

// ─── Header ──────────────────────────────────────────────────────────────────

/// The persisted header of one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub snapshot_id:   Uuid,
  pub definition:    String,
  pub snapshot_type: Schedule,
  /// Always the first day of the captured month.
  pub snapshot_date: NaiveDate,
  pub source:        Source,
  pub is_test:       bool,
  /// Server-assigned; never changes after creation.
  pub created_at:    DateTime<Utc>,
}

impl Snapshot {
  pub fn key(&self) -> SnapshotKey {
    SnapshotKey {
      definition:    self.definition.clone(),
      snapshot_date: self.snapshot_date,
      source:        self.source,
    }
  }
}

/// The uniqueness key of a snapshot header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
  pub definition:    String,
  pub snapshot_date: NaiveDate,
  pub source:        Source,
}

impl fmt::Display for SnapshotKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} @ {} ({})", self.definition, self.snapshot_date, self.source)
  }
}

// ─── Fact rows ───────────────────────────────────────────────────────────────

/// One measure row belonging to a snapshot: either the single aggregate row
/// of a dataset (no label) or one row per dimension value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
  pub label:    Option<String>,
  pub measures: BTreeMap<String, f64>,
}

impl FactRow {
  pub fn new(label: Option<String>) -> Self {
    Self { label, measures: BTreeMap::new() }
  }

  pub fn labeled(label: impl Into<String>) -> Self { Self::new(Some(label.into())) }

  /// Builder-style measure setter.
  pub fn with(mut self, name: &str, value: f64) -> Self {
    self.set(name, value);
    self
  }

  pub fn set(&mut self, name: &str, value: f64) {
    self.measures.insert(name.to_owned(), value);
  }

  /// The named measure, or `0.0` when absent.
  pub fn get(&self, name: &str) -> f64 {
    self.measures.get(name).copied().unwrap_or(0.0)
  }
}

// ─── NewSnapshot ─────────────────────────────────────────────────────────────

/// Input to [`crate::store::SnapshotStore::write_snapshot`].
/// `snapshot_id` and `created_at` are always assigned by the store.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
  pub definition:    String,
  pub snapshot_type: Schedule,
  pub snapshot_date: NaiveDate,
  pub source:        Source,
  pub is_test:       bool,
  pub facts:         Vec<FactRow>,
}

impl NewSnapshot {
  pub fn key(&self) -> SnapshotKey {
    SnapshotKey {
      definition:    self.definition.clone(),
      snapshot_date: self.snapshot_date,
      source:        self.source,
    }
  }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Parameters for listing snapshot headers. Date bounds are inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFilter {
  pub definition: Option<String>,
  pub schedule:   Option<Schedule>,
  pub source:     Option<Source>,
  pub from:       Option<NaiveDate>,
  pub to:         Option<NaiveDate>,
  pub is_test:    Option<bool>,
  pub limit:      Option<usize>,
}

impl SnapshotFilter {
  /// Match exactly one (definition, date, source) key.
  pub fn for_key(key: &SnapshotKey) -> Self {
    Self {
      definition: Some(key.definition.clone()),
      source: Some(key.source),
      from: Some(key.snapshot_date),
      to: Some(key.snapshot_date),
      ..Default::default()
    }
  }
}
