//! Source query slots and the [`SourceExecutor`] abstraction.
//!
//! Automated definitions read the live operational store through named query
//! slots. Each slot holds configured SQL; any query that references both the
//! `:start` and `:end` placeholders is bound to the capture window, whatever
//! the slot.

use std::{collections::BTreeMap, convert::Infallible, future::Future, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::{Error, Result, period::Period};

/// One result row: column name → value, in column order of the query.
pub type Row = serde_json::Map<String, serde_json::Value>;

// ─── Slots ───────────────────────────────────────────────────────────────────

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
pub enum QuerySlot {
  MembersActive,
  MembersPaused,
  MembersLapsed,
  MembersJoined,
  MembersCancelled,
  Contributions,
}

// ─── Configured queries ──────────────────────────────────────────────────────

/// Query text per slot, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct SourceQueries {
  queries: BTreeMap<QuerySlot, String>,
}

impl SourceQueries {
  /// Build from a raw `slot name → SQL` map, rejecting unknown slot names.
  pub fn from_map<I, K, V>(raw: I) -> Result<Self>
  where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
  {
    let mut queries = BTreeMap::new();
    for (name, sql) in raw {
      let name = name.as_ref();
      let slot = QuerySlot::from_str(name)
        .map_err(|_| Error::invalid(format!("unknown query slot: {name:?}")))?;
      let sql = sql.into();
      if !sql.trim().is_empty() {
        queries.insert(slot, sql);
      }
    }
    Ok(Self { queries })
  }

  pub fn with(mut self, slot: QuerySlot, sql: impl Into<String>) -> Self {
    self.queries.insert(slot, sql.into());
    self
  }

  pub fn get(&self, slot: QuerySlot) -> Option<&str> {
    self.queries.get(&slot).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool { self.queries.is_empty() }
}

/// The `(start, end)` values to bind when `sql` references both window
/// placeholders and a window is available; `None` means run unbound.
pub fn window_binding(sql: &str, window: Option<&Period>) -> Option<(String, String)> {
  let window = window?;
  (references_placeholder(sql, ":start") && references_placeholder(sql, ":end"))
    .then(|| (window.start_text(), window.end_text()))
}

fn references_placeholder(sql: &str, placeholder: &str) -> bool {
  sql.match_indices(placeholder).any(|(at, _)| {
    sql[at + placeholder.len()..]
      .chars()
      .next()
      .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'))
  })
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Runs configured source queries against the operational store.
///
/// A slot with no configured query yields an empty row set, never an error,
/// so a deployment degrades gracefully before an integration is wired.
pub trait SourceExecutor: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Run the query configured for `slot`, binding `window` when the query
  /// text asks for it.
  fn fetch(
    &self,
    slot: QuerySlot,
    window: Option<Period>,
  ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send + '_;
}

/// A source with nothing wired: every slot is empty. Suits deployments that
/// only import payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnwiredSource;

impl SourceExecutor for UnwiredSource {
  type Error = Infallible;

  async fn fetch(&self, _slot: QuerySlot, _window: Option<Period>) -> Result<Vec<Row>, Infallible> {
    Ok(Vec::new())
  }
}
