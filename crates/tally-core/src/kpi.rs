//! KPI collection: the extension point for externally computed metrics.
//!
//! After a snapshot is written, every registered [`KpiProvider`] receives a
//! [`KpiContext`] and returns raw responses keyed by KPI id. Responses are
//! normalised into [`KpiMetric`]s; anything malformed is dropped. Each
//! provider runs behind its own error boundary.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::{error::BoxError, period::{Period, Schedule}, snapshot::Snapshot};

// ─── Context ─────────────────────────────────────────────────────────────────

/// Everything a provider gets to look at.
#[derive(Debug, Clone, Serialize)]
pub struct KpiContext {
  pub snapshot_id:   Uuid,
  pub definition:    String,
  pub snapshot_type: Schedule,
  pub snapshot_date: NaiveDate,
  pub period_start:  NaiveDateTime,
  pub period_end:    NaiveDateTime,
  /// Headline measures of the snapshot (see [`crate::aggregate::core_values`]).
  pub values:        BTreeMap<String, f64>,
  pub is_test:       bool,
}

impl KpiContext {
  pub fn new(snapshot: &Snapshot, period: &Period, values: BTreeMap<String, f64>) -> Self {
    Self {
      snapshot_id: snapshot.snapshot_id,
      definition: snapshot.definition.clone(),
      snapshot_type: snapshot.snapshot_type,
      snapshot_date: snapshot.snapshot_date,
      period_start: period.start,
      period_end: period.end,
      values,
      is_test: snapshot.is_test,
    }
  }
}

// ─── Metric ──────────────────────────────────────────────────────────────────

/// A stored KPI value. The period defaults to the owning snapshot's month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiMetric {
  pub snapshot_id:  Uuid,
  pub kpi_id:       String,
  pub value:        Value,
  pub period_year:  i32,
  pub period_month: u32,
  pub meta:         Option<Value>,
}

impl KpiMetric {
  /// Normalise one raw provider response.
  ///
  /// - scalars (number, string, bool) become `{value: scalar}`
  /// - objects need a non-null `value` and may carry `period_year`,
  ///   `period_month` (1–12) and `meta`
  /// - anything else is malformed and yields `None`
  pub fn normalize(context: &KpiContext, kpi_id: &str, raw: Value) -> Option<Self> {
    use chrono::Datelike as _;

    let kpi_id = kpi_id.trim();
    if kpi_id.is_empty() {
      return None;
    }

    let mut metric = Self {
      snapshot_id:  context.snapshot_id,
      kpi_id:       kpi_id.to_owned(),
      value:        Value::Null,
      period_year:  context.snapshot_date.year(),
      period_month: context.snapshot_date.month(),
      meta:         None,
    };

    match raw {
      Value::Number(_) | Value::String(_) | Value::Bool(_) => metric.value = raw,
      Value::Object(mut record) => {
        metric.value = match record.remove("value") {
          Some(Value::Null) | None => return None,
          Some(Value::Object(_) | Value::Array(_)) => return None,
          Some(value) => value,
        };
        if let Some(year) = record.remove("period_year").filter(|v| !v.is_null()) {
          metric.period_year = year.as_i64().and_then(|y| i32::try_from(y).ok())?;
        }
        if let Some(month) = record.remove("period_month").filter(|v| !v.is_null()) {
          metric.period_month = month
            .as_u64()
            .and_then(|m| u32::try_from(m).ok())
            .filter(|m| (1..=12).contains(m))?;
        }
        metric.meta = record.remove("meta").filter(|v| !v.is_null());
      }
      Value::Null | Value::Array(_) => return None,
    }

    Some(metric)
  }
}

// ─── Providers ───────────────────────────────────────────────────────────────

/// A pluggable source of KPI values.
pub trait KpiProvider: Send + Sync {
  /// Name used in logs.
  fn name(&self) -> &str;

  /// Compute raw `(kpi_id, response)` pairs for a freshly written snapshot.
  fn collect(&self, context: &KpiContext) -> Result<Vec<(String, Value)>, BoxError>;
}

/// Registered providers, invoked in registration order.
#[derive(Clone, Default)]
pub struct KpiCollector {
  providers: Vec<Arc<dyn KpiProvider>>,
}

impl KpiCollector {
  pub fn register(&mut self, provider: Arc<dyn KpiProvider>) { self.providers.push(provider); }

  pub fn is_empty(&self) -> bool { self.providers.is_empty() }

  /// Run every provider and normalise what they return. A provider that
  /// fails is logged and skipped; the others still contribute.
  pub fn collect(&self, context: &KpiContext) -> Vec<KpiMetric> {
    let mut metrics = Vec::new();
    for provider in &self.providers {
      let responses = match provider.collect(context) {
        Ok(responses) => responses,
        Err(e) => {
          warn!(
            provider = provider.name(),
            snapshot_id = %context.snapshot_id,
            error = %e,
            "kpi provider failed"
          );
          continue;
        }
      };
      for (kpi_id, raw) in responses {
        match KpiMetric::normalize(context, &kpi_id, raw) {
          Some(metric) => metrics.push(metric),
          None => warn!(
            provider = provider.name(),
            kpi_id = %kpi_id,
            "discarding malformed kpi response"
          ),
        }
      }
    }
    metrics
  }
}
