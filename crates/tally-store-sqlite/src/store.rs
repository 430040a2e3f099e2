//! [`SqliteStore`]: the SQLite implementation of [`SnapshotStore`].

use std::{path::Path, sync::Arc};

use chrono::{NaiveDate, Utc};
use rusqlite::{OptionalExtension as _, types::Value as SqlValue};
use uuid::Uuid;

use tally_core::{
  definition::{Definition, DefinitionRegistry},
  kpi::KpiMetric,
  snapshot::{FactRow, NewSnapshot, Snapshot, SnapshotFilter},
  store::{SnapshotStore, WriteOutcome},
};

use crate::{
  Error, Result,
  encode::{
    RawKpi, RawSnapshot, SNAPSHOT_COLUMNS, encode_date, encode_dt, encode_label, encode_uuid,
  },
  schema::{SCHEMA, fact_insert_sql, fact_select_sql, fact_table_ddl},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A snapshot store backed by a single SQLite file.
///
/// Cloning shares the inner connection and registry.
#[derive(Clone)]
pub struct SqliteStore {
  conn:     tokio_rusqlite::Connection,
  registry: Arc<DefinitionRegistry>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and create the base schema plus one
  /// fact table per registered definition.
  pub async fn open(path: impl AsRef<Path>, registry: Arc<DefinitionRegistry>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn, registry };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store.
  pub async fn open_in_memory(registry: Arc<DefinitionRegistry>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn, registry };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    let fact_tables: String = self.registry.iter().map(fact_table_ddl).collect();
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&fact_tables)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  fn definition(&self, key: &str) -> Result<&Definition> {
    self
      .registry
      .get(key)
      .ok_or_else(|| Error::UnknownDefinition(key.to_owned()))
  }

  /// Number of rows in `table`, orphaned or not.
  #[cfg(test)]
  pub(crate) async fn count_rows(&self, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM \"{table}\"");
    Ok(self.conn.call(move |conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?)).await?)
  }
}

/// `WHERE` clause and positional parameters for a [`SnapshotFilter`].
fn filter_clause(filter: &SnapshotFilter) -> (String, Vec<SqlValue>) {
  let mut conds: Vec<String> = vec![];
  let mut params: Vec<SqlValue> = vec![];
  let mut push = |cond: &str, value: SqlValue| {
    params.push(value);
    conds.push(format!("{cond} ?{}", params.len()));
  };

  if let Some(definition) = &filter.definition {
    push("definition =", SqlValue::Text(definition.clone()));
  }
  if let Some(schedule) = filter.schedule {
    push("snapshot_type =", SqlValue::Text(schedule.to_string()));
  }
  if let Some(source) = filter.source {
    push("source =", SqlValue::Text(source.to_string()));
  }
  if let Some(from) = filter.from {
    push("snapshot_date >=", SqlValue::Text(encode_date(from)));
  }
  if let Some(to) = filter.to {
    push("snapshot_date <=", SqlValue::Text(encode_date(to)));
  }
  if let Some(is_test) = filter.is_test {
    push("is_test =", SqlValue::Integer(i64::from(is_test)));
  }

  let clause = if conds.is_empty() {
    String::new()
  } else {
    format!("WHERE {}", conds.join(" AND "))
  };
  (clause, params)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
  matches!(
    e,
    rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
  )
}

// ─── SnapshotStore impl ──────────────────────────────────────────────────────

impl SnapshotStore for SqliteStore {
  type Error = Error;

  // ── Writes ────────────────────────────────────────────────────────────────

  async fn write_snapshot(&self, input: NewSnapshot) -> Result<WriteOutcome> {
    let definition = self.definition(&input.definition)?;
    let key = input.key();

    let snapshot = Snapshot {
      snapshot_id:   Uuid::new_v4(),
      definition:    input.definition,
      snapshot_type: input.snapshot_type,
      snapshot_date: input.snapshot_date,
      source:        input.source,
      is_test:       input.is_test,
      created_at:    Utc::now(),
    };

    let id_str     = encode_uuid(snapshot.snapshot_id);
    let def_str    = snapshot.definition.clone();
    let type_str   = snapshot.snapshot_type.to_string();
    let date_str   = encode_date(snapshot.snapshot_date);
    let source_str = snapshot.source.to_string();
    let is_test    = snapshot.is_test;
    let at_str     = encode_dt(snapshot.created_at);

    let insert_fact = fact_insert_sql(definition);
    let measures: Vec<String> =
      definition.schema.measure_names().map(str::to_owned).collect();
    let fact_params: Vec<Vec<SqlValue>> = input
      .facts
      .iter()
      .enumerate()
      .map(|(position, fact)| {
        let mut values = vec![
          SqlValue::Text(id_str.clone()),
          SqlValue::Integer(position as i64),
          encode_label(fact.label.as_deref()),
        ];
        values.extend(measures.iter().map(|m| SqlValue::Real(fact.get(m))));
        values
      })
      .collect();

    let written = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let inserted = tx.execute(
          "INSERT INTO snapshots (
             snapshot_id, definition, snapshot_type, snapshot_date,
             source, is_test, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![id_str, def_str, type_str, date_str, source_str, is_test, at_str],
        );
        match inserted {
          Ok(_) => {}
          // The transaction rolls back on drop.
          Err(e) if is_constraint_violation(&e) => return Ok(false),
          Err(e) => return Err(e.into()),
        }

        {
          let mut stmt = tx.prepare(&insert_fact)?;
          for params in &fact_params {
            stmt.execute(rusqlite::params_from_iter(params.iter()))?;
          }
        }

        tx.commit()?;
        Ok(true)
      })
      .await?;

    Ok(if written {
      WriteOutcome::Written(snapshot)
    } else {
      WriteOutcome::Conflict(key)
    })
  }

  async fn replace_kpis(&self, snapshot_id: Uuid, metrics: Vec<KpiMetric>) -> Result<usize> {
    let id_str = encode_uuid(snapshot_id);
    let rows: Vec<(String, String, i32, u32, Option<String>)> = metrics
      .iter()
      .map(|m| {
        Ok((
          m.kpi_id.clone(),
          serde_json::to_string(&m.value)?,
          m.period_year,
          m.period_month,
          m.meta.as_ref().map(serde_json::to_string).transpose()?,
        ))
      })
      .collect::<Result<_>>()?;

    let stored = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM kpi_metrics WHERE snapshot_id = ?1", rusqlite::params![id_str])?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO kpi_metrics (
               snapshot_id, kpi_id, value_json, period_year, period_month, meta_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          )?;
          for (kpi_id, value_json, year, month, meta_json) in &rows {
            stmt.execute(rusqlite::params![id_str, kpi_id, value_json, year, month, meta_json])?;
          }
        }
        tx.commit()?;
        Ok(rows.len())
      })
      .await?;

    Ok(stored)
  }

  async fn delete_snapshot(&self, snapshot_id: Uuid) -> Result<bool> {
    let id_str = encode_uuid(snapshot_id);
    let deleted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM snapshots WHERE snapshot_id = ?1",
          rusqlite::params![id_str],
        )?)
      })
      .await?;
    Ok(deleted > 0)
  }

  async fn prune_before(&self, cutoff: NaiveDate) -> Result<u64> {
    let cutoff_str = encode_date(cutoff);
    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM snapshots WHERE snapshot_date < ?1",
          rusqlite::params![cutoff_str],
        )?)
      })
      .await?;
    Ok(removed as u64)
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn snapshot_exists(&self, filter: SnapshotFilter) -> Result<bool> {
    let (where_clause, params) = filter_clause(&filter);
    let exists = self
      .conn
      .call(move |conn| {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM snapshots {where_clause})");
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
          row.get::<_, bool>(0)
        })?)
      })
      .await?;
    Ok(exists)
  }

  async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>> {
    let id_str = encode_uuid(snapshot_id);
    let raw: Option<RawSnapshot> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE snapshot_id = ?1"),
            rusqlite::params![id_str],
            RawSnapshot::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawSnapshot::into_snapshot).transpose()
  }

  async fn list_snapshots(&self, filter: SnapshotFilter) -> Result<Vec<Snapshot>> {
    let (where_clause, params) = filter_clause(&filter);
    let limit = filter.limit.map_or(-1, |l| l as i64);

    let raws: Vec<RawSnapshot> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
           {where_clause}
           ORDER BY snapshot_date, definition, source, created_at
           LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params.iter()), RawSnapshot::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSnapshot::into_snapshot).collect()
  }

  async fn get_facts(&self, snapshot_id: Uuid) -> Result<Vec<FactRow>> {
    let Some(snapshot) = self.get_snapshot(snapshot_id).await? else {
      return Ok(Vec::new());
    };
    let definition = self.definition(&snapshot.definition)?;
    let select = fact_select_sql(definition);
    let measures: Vec<String> =
      definition.schema.measure_names().map(str::to_owned).collect();
    let id_str = encode_uuid(snapshot_id);

    let facts = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&select)?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            let mut fact = FactRow::new(row.get(0)?);
            for (i, name) in measures.iter().enumerate() {
              fact.set(name, row.get(i + 1)?);
            }
            Ok(fact)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(facts)
  }

  async fn get_kpis(&self, snapshot_id: Uuid) -> Result<Vec<KpiMetric>> {
    let id_str = encode_uuid(snapshot_id);
    let raws: Vec<RawKpi> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT snapshot_id, kpi_id, value_json, period_year, period_month, meta_json
           FROM kpi_metrics
           WHERE snapshot_id = ?1
           ORDER BY kpi_row_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawKpi {
              snapshot_id:  row.get(0)?,
              kpi_id:       row.get(1)?,
              value_json:   row.get(2)?,
              period_year:  row.get(3)?,
              period_month: row.get(4)?,
              meta_json:    row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawKpi::into_metric).collect()
  }
}
