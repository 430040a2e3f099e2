//! [`SqliteSource`]: runs configured source queries against an operational
//! SQLite database.

use std::path::Path;

use tracing::debug;

use tally_core::{
  period::Period,
  source::{QuerySlot, Row, SourceExecutor, SourceQueries, window_binding},
};

use crate::{Error, Result, encode::sql_to_json};

#[derive(Clone)]
pub struct SqliteSource {
  conn:    tokio_rusqlite::Connection,
  queries: SourceQueries,
}

impl SqliteSource {
  pub async fn open(path: impl AsRef<Path>, queries: SourceQueries) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Ok(Self { conn, queries })
  }

  /// An empty in-memory database. With no queries configured every slot
  /// reads as empty.
  pub async fn open_in_memory(queries: SourceQueries) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Ok(Self { conn, queries })
  }

  /// Run a batch of statements directly. Used to seed fixtures.
  pub async fn execute_batch(&self, sql: impl Into<String>) -> Result<()> {
    let sql = sql.into();
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(&sql)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

impl SourceExecutor for SqliteSource {
  type Error = Error;

  async fn fetch(&self, slot: QuerySlot, window: Option<Period>) -> Result<Vec<Row>> {
    let Some(sql) = self.queries.get(slot) else {
      debug!(slot = %slot, "no query configured; slot reads as empty");
      return Ok(Vec::new());
    };
    let binding = window_binding(sql, window.as_ref());
    let sql = sql.to_owned();

    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();

        let to_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Row> {
          let mut record = Row::new();
          for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), sql_to_json(row.get_ref(i)?));
          }
          Ok(record)
        };

        let rows = match &binding {
          Some((start, end)) => stmt
            .query_map(rusqlite::named_params! { ":start": start, ":end": end }, to_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
          None => stmt.query_map([], to_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
      })
      .await?;

    debug!(slot = %slot, rows = rows.len(), "source query complete");
    Ok(rows)
  }
}
