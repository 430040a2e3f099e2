//! The definition registry: the catalog of dataset shapes.
//!
//! Each definition maps a dataset key to everything needed to capture it: the
//! acquisition mode, the aggregation strategy, the fact schema (and therefore
//! the output headers) and the default capture schedules. The registry is
//! built once per process and shared by reference.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{
  Error, Result,
  period::Schedule,
  snapshot::FactRow,
  source::QuerySlot,
};

/// Fact-table columns every definition carries; measure and dimension names
/// may not reuse them.
pub const RESERVED_COLUMNS: &[&str] = &["fact_id", "snapshot_id", "position", "label"];

// ─── Acquisition ─────────────────────────────────────────────────────────────

/// How a definition's data enters the system.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AcquisitionMode {
  /// Computed from source queries by the engine.
  Automated,
  /// Supplied from outside as an import payload.
  Import,
  /// Declared but not yet capturable.
  Planned,
}

/// Which aggregator turns raw rows into fact rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Aggregation {
  /// State counts from the membership slots plus joins, cancels and net
  /// change from the period slots.
  MembershipTotals,
  /// Count rows of `slot` grouped by the value of `column`.
  Breakdown { slot: QuerySlot, column: String },
  /// Donor, contribution and amount metrics from the contributions slot.
  DonationMetrics,
  /// Pre-aggregated records supplied in a payload.
  Payload,
}

impl Aggregation {
  /// Measures the aggregator writes itself; they must exist in the schema.
  fn produced_measures(&self) -> &'static [&'static str] {
    match self {
      Self::MembershipTotals => &[
        "active_members",
        "paused_members",
        "lapsed_members",
        "new_joins",
        "cancellations",
        "net_change",
      ],
      Self::DonationMetrics => {
        &["donors_count", "contributions_count", "total_amount", "average_amount"]
      }
      Self::Breakdown { .. } | Self::Payload => &[],
    }
  }
}

// ─── Fact schema ─────────────────────────────────────────────────────────────

/// One measure column of a fact table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measure {
  /// Summed when records merge.
  Additive { name: String },
  /// `numerator / denominator`, recomputed from merged sums.
  Ratio {
    name:        String,
    numerator:   String,
    denominator: String,
  },
  /// `minuend - subtrahend`, recomputed from merged sums.
  Difference {
    name:       String,
    minuend:    String,
    subtrahend: String,
  },
}

impl Measure {
  pub fn additive(name: &str) -> Self { Self::Additive { name: name.to_owned() } }

  pub fn ratio(name: &str, numerator: &str, denominator: &str) -> Self {
    Self::Ratio {
      name:        name.to_owned(),
      numerator:   numerator.to_owned(),
      denominator: denominator.to_owned(),
    }
  }

  pub fn difference(name: &str, minuend: &str, subtrahend: &str) -> Self {
    Self::Difference {
      name:       name.to_owned(),
      minuend:    minuend.to_owned(),
      subtrahend: subtrahend.to_owned(),
    }
  }

  pub fn name(&self) -> &str {
    match self {
      Self::Additive { name } | Self::Ratio { name, .. } | Self::Difference { name, .. } => name,
    }
  }

  pub fn is_additive(&self) -> bool { matches!(self, Self::Additive { .. }) }

  fn inputs(&self) -> Vec<&str> {
    match self {
      Self::Additive { .. } => vec![],
      Self::Ratio { numerator, denominator, .. } => vec![numerator, denominator],
      Self::Difference { minuend, subtrahend, .. } => vec![minuend, subtrahend],
    }
  }
}

/// The column layout of a definition's fact rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSchema {
  /// Column holding the dimension label, or `None` for single-row datasets.
  pub dimension: Option<String>,
  pub measures:  Vec<Measure>,
}

impl FactSchema {
  pub fn additive(&self) -> impl Iterator<Item = &str> {
    self.measures.iter().filter(|m| m.is_additive()).map(Measure::name)
  }

  pub fn measure_names(&self) -> impl Iterator<Item = &str> {
    self.measures.iter().map(Measure::name)
  }

  pub fn measure(&self, name: &str) -> Option<&Measure> {
    self.measures.iter().find(|m| m.name() == name)
  }

  /// Compute derived measures from the row's additive values. With
  /// `overwrite = false` values already present on the row are kept.
  pub fn derive(&self, row: &mut FactRow, overwrite: bool) {
    for measure in &self.measures {
      let value = match measure {
        Measure::Additive { .. } => continue,
        Measure::Ratio { numerator, denominator, .. } => {
          ratio(row.get(numerator), row.get(denominator))
        }
        Measure::Difference { minuend, subtrahend, .. } => {
          row.get(minuend) - row.get(subtrahend)
        }
      };
      if overwrite || !row.measures.contains_key(measure.name()) {
        row.set(measure.name(), value);
      }
    }
  }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
  if denominator == 0.0 { 0.0 } else { numerator / denominator }
}

// ─── Definition ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Definition {
  pub key:         String,
  pub label:       String,
  pub mode:        AcquisitionMode,
  pub aggregation: Aggregation,
  pub schema:      FactSchema,
  /// Sub-dataset key this definition reads from an import payload.
  pub payload_key: String,
  /// Schedules an unqualified automated capture includes this definition in.
  pub schedules:   Vec<Schedule>,
}

impl Definition {
  /// Ordered output headers: the dimension column (if any) then every
  /// measure in schema order.
  pub fn headers(&self) -> Vec<&str> {
    self
      .schema
      .dimension
      .as_deref()
      .into_iter()
      .chain(self.schema.measure_names())
      .collect()
  }

  pub fn is_dimensional(&self) -> bool { self.schema.dimension.is_some() }

  /// The SQL table holding this definition's fact rows.
  pub fn fact_table(&self) -> String { format!("fact_{}", self.key) }

  pub fn runs_on(&self, schedule: Schedule) -> bool {
    self.mode == AcquisitionMode::Automated && self.schedules.contains(&schedule)
  }
}

/// Declarative form of a definition, as read from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSpec {
  pub key:         String,
  pub label:       String,
  pub mode:        AcquisitionMode,
  #[serde(default)]
  pub aggregation: Option<Aggregation>,
  #[serde(default)]
  pub payload_key: Option<String>,
  #[serde(default)]
  pub schedules:   Vec<Schedule>,
  #[serde(default)]
  pub dimension:   Option<String>,
  pub measures:    Vec<Measure>,
}

impl TryFrom<DefinitionSpec> for Definition {
  type Error = Error;

  fn try_from(spec: DefinitionSpec) -> Result<Self> {
    let key = spec.key;
    let bad = |msg: String| Error::invalid(format!("definition {key:?}: {msg}"));

    if !is_identifier(&key) {
      return Err(bad("key must be a lowercase identifier".into()));
    }
    if spec.label.trim().is_empty() {
      return Err(bad("label is empty".into()));
    }

    let aggregation = match (spec.mode, spec.aggregation) {
      (AcquisitionMode::Automated, Some(Aggregation::Payload) | None) => {
        return Err(bad("automated definitions need an aggregation strategy".into()));
      }
      (AcquisitionMode::Automated, Some(strategy)) => strategy,
      (_, None | Some(Aggregation::Payload)) => Aggregation::Payload,
      (mode, Some(_)) => {
        return Err(bad(format!("{mode} definitions only accept payloads")));
      }
    };

    if let Some(dimension) = &spec.dimension
      && (!is_identifier(dimension) || RESERVED_COLUMNS.contains(&dimension.as_str()))
    {
      return Err(bad(format!("invalid dimension column {dimension:?}")));
    }

    if spec.measures.is_empty() {
      return Err(bad("at least one measure is required".into()));
    }
    let mut seen = BTreeSet::new();
    for measure in &spec.measures {
      let name = measure.name();
      if !is_identifier(name) || RESERVED_COLUMNS.contains(&name) {
        return Err(bad(format!("invalid measure name {name:?}")));
      }
      if spec.dimension.as_deref() == Some(name) || !seen.insert(name) {
        return Err(bad(format!("duplicate column {name:?}")));
      }
    }
    let schema = FactSchema { dimension: spec.dimension, measures: spec.measures };
    for measure in &schema.measures {
      for input in measure.inputs() {
        if !schema.measure(input).is_some_and(Measure::is_additive) {
          return Err(bad(format!(
            "measure {:?} must reference an additive measure, not {input:?}",
            measure.name()
          )));
        }
      }
    }

    for produced in aggregation.produced_measures() {
      if schema.measure(produced).is_none() {
        return Err(bad(format!("aggregation writes {produced:?}, which is not a measure")));
      }
    }
    if let Aggregation::Breakdown { column, .. } = &aggregation {
      if schema.dimension.is_none() {
        return Err(bad("breakdowns need a dimension column".into()));
      }
      if !is_identifier(column) {
        return Err(bad(format!("invalid breakdown column {column:?}")));
      }
      if schema.additive().next().is_none() {
        return Err(bad("breakdowns need an additive count measure".into()));
      }
    }

    let payload_key = spec.payload_key.unwrap_or_else(|| key.clone());
    if payload_key.trim().is_empty() {
      return Err(bad("payload key is empty".into()));
    }

    Ok(Self {
      key,
      label: spec.label,
      mode: spec.mode,
      aggregation,
      schema,
      payload_key,
      schedules: spec.schedules,
    })
  }
}

fn is_identifier(s: &str) -> bool {
  let mut chars = s.chars();
  s.len() <= 48
    && chars.next().is_some_and(|c| c.is_ascii_lowercase())
    && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Immutable lookup table of definitions, keyed by dataset key.
#[derive(Debug, Clone)]
pub struct DefinitionRegistry {
  definitions: BTreeMap<String, Definition>,
}

impl Default for DefinitionRegistry {
  fn default() -> Self { Self::builtin() }
}

impl DefinitionRegistry {
  /// The built-in catalog.
  pub fn builtin() -> Self {
    let definitions = builtin_specs()
      .into_iter()
      .map(|spec| Definition::try_from(spec).map(|d| (d.key.clone(), d)))
      .collect::<Result<_>>()
      .expect("built-in definitions pass their own validation");
    Self { definitions }
  }

  /// The built-in catalog extended with configured definitions. Extra keys
  /// may not shadow built-in ones.
  pub fn with_extra(extra: impl IntoIterator<Item = DefinitionSpec>) -> Result<Self> {
    let mut registry = Self::builtin();
    for spec in extra {
      let definition = Definition::try_from(spec)?;
      if registry.definitions.contains_key(&definition.key) {
        return Err(Error::invalid(format!(
          "definition {:?} is already registered",
          definition.key
        )));
      }
      registry.definitions.insert(definition.key.clone(), definition);
    }
    Ok(registry)
  }

  pub fn get(&self, key: &str) -> Option<&Definition> { self.definitions.get(key) }

  /// Look up `key`, naming it in the error when absent.
  pub fn require(&self, key: &str) -> Result<&Definition> {
    self
      .get(key)
      .ok_or_else(|| Error::invalid(format!("Unknown definition: {key:?}")))
  }

  pub fn iter(&self) -> impl Iterator<Item = &Definition> { self.definitions.values() }

  /// Automated definitions whose default schedules include `schedule`.
  pub fn scheduled(&self, schedule: Schedule) -> Vec<&Definition> {
    self.iter().filter(|d| d.runs_on(schedule)).collect()
  }
}

fn builtin_specs() -> Vec<DefinitionSpec> {
  use Schedule::*;

  let spec = |key: &str,
              label: &str,
              mode: AcquisitionMode,
              aggregation: Aggregation,
              payload_key: &str,
              schedules: Vec<Schedule>,
              dimension: Option<&str>,
              measures: Vec<Measure>| DefinitionSpec {
    key: key.to_owned(),
    label: label.to_owned(),
    mode,
    aggregation: Some(aggregation),
    payload_key: Some(payload_key.to_owned()),
    schedules,
    dimension: dimension.map(str::to_owned),
    measures,
  };

  vec![
    spec(
      "membership_totals",
      "Membership totals",
      AcquisitionMode::Automated,
      Aggregation::MembershipTotals,
      "totals",
      vec![Monthly, Quarterly, Annually],
      None,
      vec![
        Measure::additive("active_members"),
        Measure::additive("paused_members"),
        Measure::additive("lapsed_members"),
        Measure::additive("new_joins"),
        Measure::additive("cancellations"),
        Measure::difference("net_change", "new_joins", "cancellations"),
      ],
    ),
    spec(
      "membership_plans",
      "Active members by plan",
      AcquisitionMode::Automated,
      Aggregation::Breakdown { slot: QuerySlot::MembersActive, column: "plan_code".into() },
      "plans",
      vec![Monthly, Quarterly],
      Some("plan_code"),
      vec![Measure::additive("members_count")],
    ),
    spec(
      "membership_types",
      "Active members by membership type",
      AcquisitionMode::Automated,
      Aggregation::Breakdown {
        slot:   QuerySlot::MembersActive,
        column: "membership_type".into(),
      },
      "types",
      vec![Monthly],
      Some("membership_type"),
      vec![Measure::additive("members_count")],
    ),
    spec(
      "donation_metrics",
      "Donation metrics",
      AcquisitionMode::Automated,
      Aggregation::DonationMetrics,
      "metrics",
      vec![Monthly, Annually],
      None,
      vec![
        Measure::additive("donors_count"),
        Measure::additive("contributions_count"),
        Measure::additive("total_amount"),
        Measure::ratio("average_amount", "total_amount", "contributions_count"),
      ],
    ),
    spec(
      "event_types",
      "Events by type",
      AcquisitionMode::Import,
      Aggregation::Payload,
      "events",
      vec![],
      Some("event_type"),
      vec![
        Measure::additive("events_count"),
        Measure::additive("participants_count"),
        Measure::additive("total_revenue"),
        Measure::ratio("avg_revenue_per_event", "total_revenue", "events_count"),
        Measure::ratio("avg_revenue_per_participant", "total_revenue", "participants_count"),
      ],
    ),
    spec(
      "donation_ranges",
      "Donations by amount range",
      AcquisitionMode::Import,
      Aggregation::Payload,
      "ranges",
      vec![],
      Some("range_label"),
      vec![
        Measure::additive("donors_count"),
        Measure::additive("contributions_count"),
        Measure::additive("total_amount"),
        Measure::ratio("average_amount", "total_amount", "contributions_count"),
      ],
    ),
    spec(
      "retention_cohorts",
      "Member retention by join cohort",
      AcquisitionMode::Planned,
      Aggregation::Payload,
      "cohorts",
      vec![],
      Some("cohort"),
      vec![
        Measure::additive("cohort_size"),
        Measure::additive("retained_count"),
        Measure::ratio("retention_rate", "retained_count", "cohort_size"),
      ],
    ),
  ]
}
