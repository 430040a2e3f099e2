//! SQL schema for the Tally SQLite store.
//!
//! The base tables are fixed; each registered definition adds its own
//! `fact_<key>` table whose measure columns follow the definition's schema.
//! Everything is idempotent thanks to `CREATE TABLE IF NOT EXISTS`.

use tally_core::definition::Definition;

/// Base schema DDL.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Snapshot headers. Rows are never updated; the UNIQUE key is what keeps a
-- scheduler run and a manual run of the same provenance from both landing.
CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id   TEXT PRIMARY KEY,
    definition    TEXT NOT NULL,
    snapshot_type TEXT NOT NULL,   -- 'monthly' | 'quarterly' | ...
    snapshot_date TEXT NOT NULL,   -- YYYY-MM-DD, always the 1st of a month
    source        TEXT NOT NULL,   -- 'automated' | 'manual_form' | ...
    is_test       INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,   -- ISO 8601 UTC; server-assigned
    UNIQUE (definition, snapshot_date, source)
);

-- Replaced wholesale per snapshot on every KPI collection.
CREATE TABLE IF NOT EXISTS kpi_metrics (
    kpi_row_id   INTEGER PRIMARY KEY,
    snapshot_id  TEXT NOT NULL REFERENCES snapshots(snapshot_id) ON DELETE CASCADE,
    kpi_id       TEXT NOT NULL,
    value_json   TEXT NOT NULL,
    period_year  INTEGER NOT NULL,
    period_month INTEGER NOT NULL,
    meta_json    TEXT
);

CREATE INDEX IF NOT EXISTS snapshots_date_idx ON snapshots(snapshot_date);
CREATE INDEX IF NOT EXISTS snapshots_type_idx ON snapshots(snapshot_type);
CREATE INDEX IF NOT EXISTS kpi_snapshot_idx   ON kpi_metrics(snapshot_id);

PRAGMA user_version = 1;
";

/// DDL for one definition's fact table.
///
/// Table and column names come from a validated registry (lowercase
/// identifiers only) and are quoted regardless.
pub fn fact_table_ddl(definition: &Definition) -> String {
  let table = definition.fact_table();
  let measures: String = definition
    .schema
    .measure_names()
    .map(|name| format!(",\n    \"{name}\" REAL NOT NULL DEFAULT 0"))
    .collect();

  format!(
    "CREATE TABLE IF NOT EXISTS \"{table}\" (
    fact_id     INTEGER PRIMARY KEY,
    snapshot_id TEXT NOT NULL REFERENCES snapshots(snapshot_id) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    label       TEXT{measures}
);
CREATE INDEX IF NOT EXISTS \"{table}_snapshot_idx\" ON \"{table}\"(snapshot_id);
"
  )
}

/// `INSERT` for one fact row: `snapshot_id, position, label`, then every
/// measure in schema order.
pub fn fact_insert_sql(definition: &Definition) -> String {
  let names: Vec<&str> = definition.schema.measure_names().collect();
  let columns: String = names.iter().map(|n| format!(", \"{n}\"")).collect();
  let params: String = (0..names.len()).map(|i| format!(", ?{}", i + 4)).collect();
  format!(
    "INSERT INTO \"{}\" (snapshot_id, position, label{columns}) VALUES (?1, ?2, ?3{params})",
    definition.fact_table()
  )
}

/// `SELECT` of a snapshot's fact rows in insertion order: `label`, then every
/// measure in schema order.
pub fn fact_select_sql(definition: &Definition) -> String {
  let columns: String = definition
    .schema
    .measure_names()
    .map(|n| format!(", \"{n}\""))
    .collect();
  format!(
    "SELECT label{columns} FROM \"{}\" WHERE snapshot_id = ?1 ORDER BY position",
    definition.fact_table()
  )
}

#[cfg(test)]
mod tests {
  use tally_core::definition::DefinitionRegistry;

  use super::*;

  #[test]
  fn insert_binds_every_measure() {
    let registry = DefinitionRegistry::builtin();
    let sql = fact_insert_sql(registry.require("donation_metrics").unwrap());
    assert_eq!(
      sql,
      "INSERT INTO \"fact_donation_metrics\" (snapshot_id, position, label, \
       \"donors_count\", \"contributions_count\", \"total_amount\", \"average_amount\") \
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    );
  }

  #[test]
  fn ddl_has_a_column_per_measure() {
    let registry = DefinitionRegistry::builtin();
    let ddl = fact_table_ddl(registry.require("membership_plans").unwrap());
    assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"fact_membership_plans\""));
    assert!(ddl.contains("\"members_count\" REAL NOT NULL DEFAULT 0"));
    assert!(ddl.contains("ON DELETE CASCADE"));
  }
}
