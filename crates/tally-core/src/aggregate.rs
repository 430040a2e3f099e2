//! Aggregators: raw source rows and import payloads → fact rows.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::{
  Error, Result,
  definition::{Definition, FactSchema, Measure},
  snapshot::FactRow,
  source::Row,
};

/// Label used for rows that carry no value in the grouping column.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Contribution statuses that never count towards donation metrics.
const EXCLUDED_STATUSES: &[&str] = &["failed", "refunded", "cancelled"];

// ─── Membership ──────────────────────────────────────────────────────────────

/// Row sets consumed by the membership totals aggregator.
#[derive(Debug, Clone, Default)]
pub struct MembershipRows {
  pub active:    Vec<Row>,
  pub paused:    Vec<Row>,
  pub lapsed:    Vec<Row>,
  /// Joins inside the capture window.
  pub joined:    Vec<Row>,
  /// Cancellations inside the capture window.
  pub cancelled: Vec<Row>,
}

pub fn membership_totals(rows: &MembershipRows) -> FactRow {
  let joins = rows.joined.len() as f64;
  let cancels = rows.cancelled.len() as f64;
  FactRow::new(None)
    .with("active_members", rows.active.len() as f64)
    .with("paused_members", rows.paused.len() as f64)
    .with("lapsed_members", rows.lapsed.len() as f64)
    .with("new_joins", joins)
    .with("cancellations", cancels)
    .with("net_change", joins - cancels)
}

/// Count rows grouped by the value of `column`, one fact row per distinct
/// label, ordered by label.
pub fn breakdown(rows: &[Row], column: &str, measure: &str) -> Vec<FactRow> {
  let mut counts: BTreeMap<String, u64> = BTreeMap::new();
  for row in rows {
    let label = row
      .get(column)
      .and_then(label_of)
      .unwrap_or_else(|| UNKNOWN_LABEL.to_owned());
    *counts.entry(label).or_default() += 1;
  }
  counts
    .into_iter()
    .map(|(label, count)| FactRow::labeled(label).with(measure, count as f64))
    .collect()
}

// ─── Donations ───────────────────────────────────────────────────────────────

/// Donor and contribution metrics. Rows with an excluded `status` or a truthy
/// `is_test` are ignored; donors are counted by distinct `donor_id`.
pub fn donation_metrics(rows: &[Row]) -> FactRow {
  let mut donors = BTreeSet::new();
  let mut anonymous = 0_u64;
  let mut contributions = 0_u64;
  let mut total = 0.0;

  for row in rows {
    let excluded_status = row
      .get("status")
      .and_then(Value::as_str)
      .is_some_and(|s| EXCLUDED_STATUSES.contains(&s.trim().to_ascii_lowercase().as_str()));
    if excluded_status || row.get("is_test").is_some_and(is_truthy) {
      continue;
    }

    contributions += 1;
    total += row.get("amount").and_then(as_number).unwrap_or(0.0);
    match row.get("donor_id").and_then(label_of) {
      Some(donor) => {
        donors.insert(donor);
      }
      None => anonymous += 1,
    }
  }

  let contributions = contributions as f64;
  FactRow::new(None)
    .with("donors_count", (donors.len() as u64 + anonymous) as f64)
    .with("contributions_count", contributions)
    .with("total_amount", total)
    .with(
      "average_amount",
      if contributions == 0.0 { 0.0 } else { total / contributions },
    )
}

// ─── Payloads ────────────────────────────────────────────────────────────────

/// Sub-dataset key → records.
pub type ImportPayload = serde_json::Map<String, Value>;

/// Convert the definition's sub-dataset of `payload` into fact rows.
///
/// Additive measures default to `0`; derived measures missing from a record
/// are computed from that record's own values. Anything that is not an array
/// of objects with numeric measures is rejected.
pub fn from_payload(definition: &Definition, payload: &ImportPayload) -> Result<Vec<FactRow>> {
  let key = &definition.payload_key;
  let records = match payload.get(key) {
    Some(Value::Array(records)) => records.as_slice(),
    // A single-row dataset may be supplied as a bare object.
    Some(record @ Value::Object(_)) if !definition.is_dimensional() => std::slice::from_ref(record),
    Some(_) => {
      return Err(Error::invalid(format!(
        "payload {key:?} for {} must be an array of records",
        definition.key
      )));
    }
    None => {
      return Err(Error::invalid(format!(
        "payload is missing the {key:?} dataset required by {}",
        definition.key
      )));
    }
  };

  records
    .iter()
    .enumerate()
    .map(|(i, record)| record_to_row(&definition.schema, record).map_err(|msg| {
      Error::invalid(format!("payload {key:?} record {i}: {msg}"))
    }))
    .collect()
}

fn record_to_row(schema: &FactSchema, record: &Value) -> Result<FactRow, String> {
  let Value::Object(fields) = record else {
    return Err("expected an object".into());
  };

  let label = match &schema.dimension {
    Some(column) => Some(
      fields
        .get(column)
        .and_then(label_of)
        .ok_or_else(|| format!("missing {column:?} label"))?,
    ),
    None => None,
  };

  let mut row = FactRow::new(label);
  for measure in &schema.measures {
    let name = measure.name();
    match fields.get(name) {
      None | Some(Value::Null) => {
        if let Measure::Additive { .. } = measure {
          row.set(name, 0.0);
        }
      }
      Some(value) => {
        let number = as_number(value).ok_or_else(|| format!("{name:?} is not numeric"))?;
        row.set(name, number);
      }
    }
  }
  schema.derive(&mut row, false);
  Ok(row)
}

/// Reject fact rows holding a measure that is not a finite number. Finite
/// inputs can still overflow once summed or divided.
pub fn ensure_finite(definition: &Definition, facts: &[FactRow]) -> Result<()> {
  for fact in facts {
    if let Some((name, value)) = fact.measures.iter().find(|(_, v)| !v.is_finite()) {
      return Err(Error::invalid(format!(
        "payload for {}: {name:?} of row {} is {value}, not a finite number",
        definition.key,
        fact.label.as_deref().unwrap_or("(total)"),
      )));
    }
  }
  Ok(())
}

// ─── KPI context values ──────────────────────────────────────────────────────

/// Headline values of a snapshot for KPI providers: the single label-less row
/// as is, or additive sums across dimension rows with derived measures
/// recomputed.
pub fn core_values(schema: &FactSchema, facts: &[FactRow]) -> BTreeMap<String, f64> {
  if let [only] = facts
    && only.label.is_none()
  {
    return only.measures.clone();
  }

  let mut totals = FactRow::new(None);
  for name in schema.additive() {
    totals.set(name, facts.iter().map(|f| f.get(name)).sum());
  }
  schema.derive(&mut totals, true);
  totals.measures
}

// ─── Value helpers ───────────────────────────────────────────────────────────

/// A JSON number, or a string holding one.
pub fn as_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
    _ => None,
  }
}

fn is_truthy(value: &Value) -> bool {
  match value {
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
    Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
    _ => false,
  }
}

fn label_of(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::definition::DefinitionRegistry;

  fn rows(values: Value) -> Vec<Row> {
    values
      .as_array()
      .unwrap()
      .iter()
      .map(|v| v.as_object().unwrap().clone())
      .collect()
  }

  #[test]
  fn membership_totals_count_states_and_net_change() {
    let input = MembershipRows {
      active:    rows(json!([{ "id": 1 }, { "id": 2 }, { "id": 3 }])),
      paused:    rows(json!([{ "id": 4 }])),
      lapsed:    vec![],
      joined:    rows(json!([{ "id": 1 }, { "id": 3 }])),
      cancelled: rows(json!([{ "id": 9 }, { "id": 8 }, { "id": 7 }])),
    };
    let row = membership_totals(&input);
    assert_eq!(row.get("active_members"), 3.0);
    assert_eq!(row.get("paused_members"), 1.0);
    assert_eq!(row.get("lapsed_members"), 0.0);
    assert_eq!(row.get("net_change"), -1.0);
  }

  #[test]
  fn breakdown_groups_and_orders_by_label() {
    let input = rows(json!([
      { "plan_code": "gold" },
      { "plan_code": "basic" },
      { "plan_code": "gold" },
      { "plan_code": null },
      { "other": 1 },
    ]));
    let facts = breakdown(&input, "plan_code", "members_count");
    let summary: Vec<_> = facts
      .iter()
      .map(|f| (f.label.clone().unwrap(), f.get("members_count")))
      .collect();
    assert_eq!(
      summary,
      vec![("basic".into(), 1.0), ("gold".into(), 2.0), ("unknown".into(), 2.0)]
    );
  }

  #[test]
  fn donation_metrics_skip_failed_and_test_rows() {
    let input = rows(json!([
      { "donor_id": 1, "amount": 500.0, "status": "completed", "is_test": 0 },
      { "donor_id": 2, "amount": "250.00", "status": "completed", "is_test": 0 },
      { "donor_id": 3, "amount": 100.0, "status": "Failed", "is_test": 0 },
      { "donor_id": 4, "amount": 900.0, "status": "completed", "is_test": "1" },
    ]));
    let row = donation_metrics(&input);
    assert_eq!(row.get("donors_count"), 2.0);
    assert_eq!(row.get("contributions_count"), 2.0);
    assert_eq!(row.get("total_amount"), 750.0);
    assert_eq!(row.get("average_amount"), 375.0);
  }

  #[test]
  fn repeat_donors_count_once() {
    let input = rows(json!([
      { "donor_id": "a", "amount": 10 },
      { "donor_id": "a", "amount": 15 },
      { "amount": 5 },
    ]));
    let row = donation_metrics(&input);
    assert_eq!(row.get("donors_count"), 2.0);
    assert_eq!(row.get("contributions_count"), 3.0);
  }

  #[test]
  fn payload_records_become_rows_with_derived_ratios() {
    let registry = DefinitionRegistry::builtin();
    let events = registry.require("event_types").unwrap();
    let payload = json!({
      "events": [
        { "event_type": "Gala", "events_count": 2, "participants_count": "40", "total_revenue": 800 },
        { "event_type": "Workshop", "events_count": 1, "avg_revenue_per_event": 99 },
      ]
    });
    let facts = from_payload(events, payload.as_object().unwrap()).unwrap();
    assert_eq!(facts.len(), 2);
    assert_eq!(facts[0].label.as_deref(), Some("Gala"));
    assert_eq!(facts[0].get("avg_revenue_per_event"), 400.0);
    assert_eq!(facts[0].get("avg_revenue_per_participant"), 20.0);
    assert_eq!(facts[1].get("total_revenue"), 0.0);
    assert_eq!(facts[1].get("avg_revenue_per_event"), 99.0);
  }

  #[test]
  fn malformed_payloads_are_invalid_input() {
    let registry = DefinitionRegistry::builtin();
    let events = registry.require("event_types").unwrap();

    let cases = [
      json!({}),
      json!({ "events": "nope" }),
      json!({ "events": [42] }),
      json!({ "events": [{ "events_count": 1 }] }),
      json!({ "events": [{ "event_type": "Gala", "events_count": "many" }] }),
    ];
    for payload in cases {
      let err = from_payload(events, payload.as_object().unwrap()).unwrap_err();
      assert!(err.is_invalid_input(), "{payload} gave {err}");
    }
  }

  #[test]
  fn single_row_payload_may_be_an_object() {
    let registry = DefinitionRegistry::builtin();
    let totals = registry.require("membership_totals").unwrap();
    let payload = json!({ "totals": { "active_members": 10, "new_joins": 4, "cancellations": 1 } });
    let facts = from_payload(totals, payload.as_object().unwrap()).unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].get("net_change"), 3.0);
    assert_eq!(facts[0].get("paused_members"), 0.0);
  }

  #[test]
  fn core_values_sum_dimension_rows() {
    let registry = DefinitionRegistry::builtin();
    let schema = &registry.require("donation_ranges").unwrap().schema;
    let facts = vec![
      FactRow::labeled("0-100").with("contributions_count", 3.0).with("total_amount", 150.0),
      FactRow::labeled("100+").with("contributions_count", 1.0).with("total_amount", 250.0),
    ];
    let values = core_values(schema, &facts);
    assert_eq!(values["contributions_count"], 4.0);
    assert_eq!(values["total_amount"], 400.0);
    assert_eq!(values["average_amount"], 100.0);
  }

  #[test]
  fn overflowing_measures_are_not_finite() {
    let registry = DefinitionRegistry::builtin();
    let events = registry.require("event_types").unwrap();

    let ok = vec![FactRow::labeled("Gala").with("total_revenue", 1e308)];
    assert!(ensure_finite(events, &ok).is_ok());

    let bad = vec![FactRow::labeled("Gala").with("total_revenue", f64::INFINITY)];
    let err = ensure_finite(events, &bad).unwrap_err();
    assert!(err.is_invalid_input());
    assert!(err.to_string().contains("total_revenue"), "{err}");

    let totals = registry.require("membership_totals").unwrap();
    let nan = vec![FactRow::new(None).with("net_change", f64::NAN)];
    assert!(ensure_finite(totals, &nan).unwrap_err().is_invalid_input());
  }
}
