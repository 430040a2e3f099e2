//! Dedup merging of fact rows whose dimension labels collide.
//!
//! Two records that normalise to the same label become one: additive measures
//! are summed and derived measures (ratios, differences) are recomputed from
//! the merged sums. Input ratios of merged groups are discarded.

use std::collections::HashMap;

use crate::{definition::FactSchema, snapshot::FactRow};

/// The grouping key for a label: trimmed and case-folded.
pub fn normalize_label(label: &str) -> String { label.trim().to_lowercase() }

/// Merge rows sharing a normalised label. Groups of one pass through
/// untouched; first-seen order and display label are kept. Label-less rows
/// form a single group of their own.
pub fn merge_by_label(schema: &FactSchema, rows: Vec<FactRow>) -> Vec<FactRow> {
  let mut groups: Vec<Vec<FactRow>> = Vec::new();
  let mut index: HashMap<Option<String>, usize> = HashMap::new();

  for row in rows {
    let key = row.label.as_deref().map(normalize_label);
    match index.get(&key) {
      Some(&at) => groups[at].push(row),
      None => {
        index.insert(key, groups.len());
        groups.push(vec![row]);
      }
    }
  }

  groups
    .into_iter()
    .filter_map(|mut group| {
      if group.len() > 1 { Some(merge_group(schema, &group)) } else { group.pop() }
    })
    .collect()
}

fn merge_group(schema: &FactSchema, group: &[FactRow]) -> FactRow {
  let mut merged = FactRow::new(group[0].label.clone());
  for name in schema.additive() {
    merged.set(name, group.iter().map(|row| row.get(name)).sum());
  }
  schema.derive(&mut merged, true);
  merged
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::definition::DefinitionRegistry;

  fn events_schema() -> FactSchema {
    DefinitionRegistry::builtin().require("event_types").unwrap().schema.clone()
  }

  fn event(label: &str, events: f64, participants: f64, revenue: f64) -> FactRow {
    let mut row = FactRow::labeled(label)
      .with("events_count", events)
      .with("participants_count", participants)
      .with("total_revenue", revenue);
    events_schema().derive(&mut row, true);
    row
  }

  #[test]
  fn equal_averages_stay_equal() {
    let merged = merge_by_label(
      &events_schema(),
      vec![event("A", 3.0, 30.0, 600.0), event("A", 2.0, 20.0, 400.0)],
    );
    assert_eq!(merged.len(), 1);
    let row = &merged[0];
    assert_eq!(row.get("events_count"), 5.0);
    assert_eq!(row.get("total_revenue"), 1000.0);
    assert_eq!(row.get("avg_revenue_per_event"), 200.0);
    assert_eq!(row.get("participants_count"), 50.0);
    assert_eq!(row.get("avg_revenue_per_participant"), 20.0);
  }

  #[test]
  fn ratios_come_from_sums_not_mean_of_ratios() {
    let merged = merge_by_label(
      &events_schema(),
      vec![event("Gala", 2.0, 10.0, 500.0), event("Gala", 1.0, 5.0, 1000.0)],
    );
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].get("events_count"), 3.0);
    assert_eq!(merged[0].get("total_revenue"), 1500.0);
    assert_eq!(merged[0].get("avg_revenue_per_event"), 500.0);
  }

  #[test]
  fn labels_collide_after_normalisation() {
    let merged = merge_by_label(
      &events_schema(),
      vec![
        event("Workshop", 1.0, 10.0, 100.0),
        event("Gala", 1.0, 10.0, 100.0),
        event("  workshop ", 1.0, 30.0, 300.0),
      ],
    );
    let labels: Vec<_> = merged.iter().map(|r| r.label.as_deref().unwrap()).collect();
    assert_eq!(labels, vec!["Workshop", "Gala"]);
    assert_eq!(merged[0].get("participants_count"), 40.0);
    assert_eq!(merged[0].get("avg_revenue_per_participant"), 10.0);
  }

  #[test]
  fn singletons_pass_through_unchanged() {
    let mut odd = event("Solo", 4.0, 8.0, 100.0);
    odd.set("avg_revenue_per_event", 99.0);
    let merged = merge_by_label(&events_schema(), vec![odd.clone()]);
    assert_eq!(merged, vec![odd]);
  }

  #[test]
  fn empty_input_yields_nothing() {
    assert!(merge_by_label(&events_schema(), vec![]).is_empty());
  }
}
