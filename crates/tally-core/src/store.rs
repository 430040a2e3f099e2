//! The `SnapshotStore` trait.
//!
//! Implemented by storage backends (e.g. `tally-store-sqlite`). The engine
//! depends on this abstraction, not on any concrete backend.

use std::future::Future;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::{
  kpi::KpiMetric,
  snapshot::{FactRow, NewSnapshot, Snapshot, SnapshotFilter, SnapshotKey},
};

/// Result of an attempted snapshot write.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
  /// Header and every fact row were committed together.
  Written(Snapshot),
  /// A header with the same key exists; nothing was written.
  Conflict(SnapshotKey),
}

/// Abstraction over snapshot persistence.
///
/// Snapshots are immutable: there is no update operation. Uniqueness of
/// (definition, snapshot_date, source) must be enforced by the backend itself
/// so that concurrent writers cannot both succeed.
pub trait SnapshotStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Writes ────────────────────────────────────────────────────────────

  /// Atomically write a header and its fact rows. A key collision is
  /// reported as [`WriteOutcome::Conflict`], not as an error.
  fn write_snapshot(
    &self,
    snapshot: NewSnapshot,
  ) -> impl Future<Output = Result<WriteOutcome, Self::Error>> + Send + '_;

  /// Replace every KPI row of a snapshot with `metrics`. Returns the number
  /// of rows stored.
  fn replace_kpis(
    &self,
    snapshot_id: Uuid,
    metrics: Vec<KpiMetric>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Delete a snapshot with its fact and KPI rows. Returns `false` if it did
  /// not exist.
  fn delete_snapshot(
    &self,
    snapshot_id: Uuid,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Delete every snapshot dated strictly before `cutoff`, cascading to its
  /// dependent rows. Returns the number of headers removed.
  fn prune_before(
    &self,
    cutoff: NaiveDate,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Whether any header matches `filter`.
  fn snapshot_exists(
    &self,
    filter: SnapshotFilter,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn get_snapshot(
    &self,
    snapshot_id: Uuid,
  ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + '_;

  /// Headers matching `filter`, ordered by date, definition and source.
  fn list_snapshots(
    &self,
    filter: SnapshotFilter,
  ) -> impl Future<Output = Result<Vec<Snapshot>, Self::Error>> + Send + '_;

  /// Fact rows of a snapshot in insertion order. Empty if the snapshot does
  /// not exist.
  fn get_facts(
    &self,
    snapshot_id: Uuid,
  ) -> impl Future<Output = Result<Vec<FactRow>, Self::Error>> + Send + '_;

  fn get_kpis(
    &self,
    snapshot_id: Uuid,
  ) -> impl Future<Output = Result<Vec<KpiMetric>, Self::Error>> + Send + '_;
}
