//! [`SnapshotEngine`]: capture, import and read access over a
//! [`SnapshotStore`] and a [`SourceExecutor`].
//!
//! A capture validates everything up front, then handles each requested
//! definition on its own: acquire rows, aggregate, merge colliding labels and
//! write header + facts as one atomic unit. A failure on one definition is
//! reported in the [`CaptureReport`] and the next definition still runs.
//! KPI collection and retention pruning follow as best-effort steps.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{NaiveDate, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  aggregate::{self, ImportPayload, MembershipRows},
  definition::{AcquisitionMode, Aggregation, Definition, DefinitionRegistry},
  kpi::{KpiCollector, KpiContext, KpiMetric, KpiProvider},
  merge::merge_by_label,
  period::{Period, Schedule, first_of_month, parse_calendar_date, parse_reference_date},
  retention::RetentionPolicy,
  snapshot::{FactRow, NewSnapshot, Snapshot, SnapshotFilter, SnapshotKey, Source},
  source::{QuerySlot, Row, SourceExecutor},
  store::{SnapshotStore, WriteOutcome},
};

// ─── Requests ────────────────────────────────────────────────────────────────

/// Parameters for [`SnapshotEngine::capture`].
#[derive(Debug, Clone)]
pub struct CaptureRequest {
  /// Definition keys to capture. Empty means every automated definition
  /// scheduled for `schedule`.
  pub definitions:           Vec<String>,
  pub schedule:              Schedule,
  pub source:                Source,
  /// Date inside the month to capture; defaults to today.
  pub reference_date:        Option<String>,
  /// Date inside the month whose window bounds period queries; defaults to
  /// the captured month.
  pub period_reference_date: Option<String>,
  /// When present, every definition reads its sub-dataset from here instead
  /// of running source queries.
  pub payload:               Option<ImportPayload>,
}

impl CaptureRequest {
  pub fn new(schedule: Schedule, source: Source) -> Self {
    Self {
      definitions: Vec::new(),
      schedule,
      source,
      reference_date: None,
      period_reference_date: None,
      payload: None,
    }
  }

  pub fn definition(mut self, key: impl Into<String>) -> Self {
    self.definitions.push(key.into());
    self
  }

  pub fn reference_date(mut self, date: impl Into<String>) -> Self {
    self.reference_date = Some(date.into());
    self
  }

  pub fn period_reference_date(mut self, date: impl Into<String>) -> Self {
    self.period_reference_date = Some(date.into());
    self
  }

  pub fn payload(mut self, payload: ImportPayload) -> Self {
    self.payload = Some(payload);
    self
  }
}

/// Parameters for [`SnapshotEngine::import_snapshot`]. Strings are validated
/// by the engine, as they usually come straight from a form or a file.
#[derive(Debug, Clone)]
pub struct ImportRequest {
  pub definition:    String,
  pub schedule:      String,
  pub snapshot_date: String,
  pub payload:       ImportPayload,
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CaptureOutcome {
  pub definition: String,
  pub result:     Result<Snapshot>,
}

/// What a [`SnapshotEngine::capture`] call did, definition by definition.
#[derive(Debug)]
pub struct CaptureReport {
  pub period:   Period,
  pub outcomes: Vec<CaptureOutcome>,
  /// Headers removed by the trailing retention pass, if it ran and succeeded.
  pub pruned:   Option<u64>,
}

impl CaptureReport {
  pub fn written(&self) -> impl Iterator<Item = &Snapshot> {
    self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
  }

  pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
    self
      .outcomes
      .iter()
      .filter_map(|o| o.result.as_ref().err().map(|e| (o.definition.as_str(), e)))
  }

  pub fn is_complete(&self) -> bool { self.failures().next().is_none() }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct SnapshotEngine<S, Q> {
  store:     Arc<S>,
  source:    Arc<Q>,
  registry:  Arc<DefinitionRegistry>,
  kpis:      KpiCollector,
  retention: RetentionPolicy,
  is_test:   bool,
  /// Pinned "today"; the system clock is used when unset.
  today:     Option<NaiveDate>,
}

impl<S, Q> SnapshotEngine<S, Q>
where
  S: SnapshotStore,
  Q: SourceExecutor,
{
  pub fn new(store: Arc<S>, source: Arc<Q>, registry: Arc<DefinitionRegistry>) -> Self {
    Self {
      store,
      source,
      registry,
      kpis: KpiCollector::default(),
      retention: RetentionPolicy::default(),
      is_test: false,
      today: None,
    }
  }

  pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
    self.retention = retention;
    self
  }

  pub fn with_kpi_provider(mut self, provider: Arc<dyn KpiProvider>) -> Self {
    self.kpis.register(provider);
    self
  }

  /// Mark every snapshot this engine writes as test data.
  pub fn with_test_flag(mut self, is_test: bool) -> Self {
    self.is_test = is_test;
    self
  }

  pub fn with_today(mut self, today: NaiveDate) -> Self {
    self.today = Some(today);
    self
  }

  pub fn registry(&self) -> &DefinitionRegistry { &self.registry }

  fn today(&self) -> NaiveDate { self.today.unwrap_or_else(|| Utc::now().date_naive()) }

  // ── Capture ───────────────────────────────────────────────────────────

  /// Capture the requested definitions for the month containing the
  /// reference date.
  ///
  /// Returns `InvalidInput` (with nothing written) if a date, definition or
  /// payload is invalid. Otherwise every definition gets an outcome in the
  /// report; conflicts, acquisition and persistence failures are reported
  /// there rather than aborting the call.
  pub async fn capture(&self, request: CaptureRequest) -> Result<CaptureReport> {
    let today = self.today();
    let period = Period::resolve(request.schedule, request.reference_date.as_deref(), today)?;
    let window = match request.period_reference_date.as_deref().map(str::trim) {
      Some(raw) if !raw.is_empty() => Period::containing(
        request.schedule,
        parse_reference_date("period_reference_date", raw)?,
      ),
      _ => period,
    };
    let plan = self.plan(&request)?;

    let mut outcomes = Vec::with_capacity(plan.len());
    for (definition, prepared) in plan {
      let result = self
        .capture_one(definition, prepared, request.source, &period, &window)
        .await;
      outcomes.push(CaptureOutcome { definition: definition.key.clone(), result });
    }

    let pruned = self.prune_quietly(today).await;
    Ok(CaptureReport { period, outcomes, pruned })
  }

  /// Resolve and validate the definitions of a capture, parsing any payload
  /// up front so that a malformed one fails before anything is written.
  fn plan(
    &self,
    request: &CaptureRequest,
  ) -> Result<Vec<(&Definition, Option<Vec<FactRow>>)>> {
    let definitions: Vec<&Definition> = if request.definitions.is_empty() {
      let scheduled = self.registry.scheduled(request.schedule);
      if scheduled.is_empty() {
        return Err(Error::invalid(format!(
          "no automated definitions run on the {} schedule",
          request.schedule
        )));
      }
      scheduled
    } else {
      request
        .definitions
        .iter()
        .map(|key| self.registry.require(key.trim()))
        .collect::<Result<_>>()?
    };

    let mut seen = BTreeSet::new();
    definitions
      .into_iter()
      .filter(|definition| seen.insert(definition.key.as_str()))
      .map(|definition| {
        if definition.mode == AcquisitionMode::Planned {
          return Err(Error::invalid(format!(
            "definition {:?} is planned and cannot be captured yet",
            definition.key
          )));
        }
        let prepared = match &request.payload {
          Some(payload) => Some(payload_facts(definition, payload)?),
          None if definition.mode == AcquisitionMode::Import => {
            return Err(Error::invalid(format!(
              "definition {:?} is import-only; supply a payload",
              definition.key
            )));
          }
          None => None,
        };
        Ok((definition, prepared))
      })
      .collect()
  }

  async fn capture_one(
    &self,
    definition: &Definition,
    prepared: Option<Vec<FactRow>>,
    source: Source,
    period: &Period,
    window: &Period,
  ) -> Result<Snapshot> {
    let key = SnapshotKey {
      definition: definition.key.clone(),
      snapshot_date: period.snapshot_date,
      source,
    };
    // Skip the source queries when the slot is visibly taken. The store's
    // unique constraint still decides races.
    if self
      .store
      .snapshot_exists(SnapshotFilter::for_key(&key))
      .await
      .map_err(persistence)?
    {
      warn!(%key, "snapshot already captured");
      return Err(Error::Conflict(key));
    }

    let facts = match prepared {
      Some(facts) => facts,
      None => {
        let acquired = self.acquire(definition, window).await.inspect_err(|e| {
          warn!(definition = %definition.key, error = %e, "acquisition failed");
        })?;
        let facts = merge_by_label(&definition.schema, acquired);
        aggregate::ensure_finite(definition, &facts)?;
        facts
      }
    };

    let snapshot = self
      .write(NewSnapshot {
        definition: definition.key.clone(),
        snapshot_type: period.schedule,
        snapshot_date: period.snapshot_date,
        source,
        is_test: self.is_test,
        facts: facts.clone(),
      })
      .await?;

    self.collect_kpis(definition, &snapshot, period, &facts).await;
    Ok(snapshot)
  }

  async fn acquire(&self, definition: &Definition, window: &Period) -> Result<Vec<FactRow>> {
    match &definition.aggregation {
      Aggregation::MembershipTotals => {
        let rows = MembershipRows {
          active:    self.fetch(definition, QuerySlot::MembersActive, window).await?,
          paused:    self.fetch(definition, QuerySlot::MembersPaused, window).await?,
          lapsed:    self.fetch(definition, QuerySlot::MembersLapsed, window).await?,
          joined:    self.fetch(definition, QuerySlot::MembersJoined, window).await?,
          cancelled: self.fetch(definition, QuerySlot::MembersCancelled, window).await?,
        };
        Ok(vec![aggregate::membership_totals(&rows)])
      }
      Aggregation::Breakdown { slot, column } => {
        let measure = definition.schema.additive().next().ok_or_else(|| {
          Error::invalid(format!("definition {:?} has no count measure", definition.key))
        })?;
        let rows = self.fetch(definition, *slot, window).await?;
        Ok(aggregate::breakdown(&rows, column, measure))
      }
      Aggregation::DonationMetrics => {
        let rows = self.fetch(definition, QuerySlot::Contributions, window).await?;
        Ok(vec![aggregate::donation_metrics(&rows)])
      }
      Aggregation::Payload => Err(Error::invalid(format!(
        "definition {:?} is only captured from a payload",
        definition.key
      ))),
    }
  }

  async fn fetch(
    &self,
    definition: &Definition,
    slot: QuerySlot,
    window: &Period,
  ) -> Result<Vec<Row>> {
    let rows = self
      .source
      .fetch(slot, Some(*window))
      .await
      .map_err(|e| Error::Acquisition {
        definition: definition.key.clone(),
        source:     Box::new(e),
      })?;
    debug!(definition = %definition.key, %slot, rows = rows.len(), "fetched source rows");
    Ok(rows)
  }

  async fn write(&self, snapshot: NewSnapshot) -> Result<Snapshot> {
    let key = snapshot.key();
    let facts = snapshot.facts.len();
    match self.store.write_snapshot(snapshot).await {
      Ok(WriteOutcome::Written(snapshot)) => {
        info!(snapshot_id = %snapshot.snapshot_id, %key, facts, "snapshot written");
        Ok(snapshot)
      }
      Ok(WriteOutcome::Conflict(key)) => {
        warn!(%key, "snapshot already exists");
        Err(Error::Conflict(key))
      }
      Err(e) => {
        error!(%key, error = %e, "snapshot write failed");
        Err(persistence(e))
      }
    }
  }

  async fn collect_kpis(
    &self,
    definition: &Definition,
    snapshot: &Snapshot,
    period: &Period,
    facts: &[FactRow],
  ) {
    if self.kpis.is_empty() {
      return;
    }
    let values = aggregate::core_values(&definition.schema, facts);
    let context = KpiContext::new(snapshot, period, values);
    let metrics = self.kpis.collect(&context);
    match self.store.replace_kpis(snapshot.snapshot_id, metrics).await {
      Ok(stored) => debug!(snapshot_id = %snapshot.snapshot_id, stored, "kpis stored"),
      Err(e) => warn!(snapshot_id = %snapshot.snapshot_id, error = %e, "storing kpis failed"),
    }
  }

  // ── Import ────────────────────────────────────────────────────────────

  /// Store an externally supplied payload as a snapshot tagged
  /// [`Source::ManualImport`], beside any automated capture of the month.
  ///
  /// Validates, in order: the date's shape, its calendar validity, the
  /// schedule, the definition and the payload.
  pub async fn import_snapshot(&self, request: ImportRequest) -> Result<Snapshot> {
    let date = parse_calendar_date("snapshot_date", &request.snapshot_date)?;
    let schedule = Schedule::parse(&request.schedule)?;
    let definition = self.registry.require(&request.definition)?;
    if definition.mode == AcquisitionMode::Planned {
      return Err(Error::invalid(format!(
        "definition {:?} is planned and cannot be imported yet",
        definition.key
      )));
    }
    let facts = payload_facts(definition, &request.payload)?;

    let period = Period::containing(schedule, date);
    let snapshot = self
      .write(NewSnapshot {
        definition: definition.key.clone(),
        snapshot_type: schedule,
        snapshot_date: period.snapshot_date,
        source: Source::ManualImport,
        is_test: self.is_test,
        facts: facts.clone(),
      })
      .await?;

    self.collect_kpis(definition, &snapshot, &period, &facts).await;
    Ok(snapshot)
  }

  // ── Existence ─────────────────────────────────────────────────────────

  /// Whether any snapshot of `schedule` from `source` exists for the month
  /// containing `date`.
  pub async fn exists(&self, schedule: Schedule, date: &str, source: Source) -> Result<bool> {
    let date = first_of_month(parse_reference_date("date", date)?);
    self
      .store
      .snapshot_exists(SnapshotFilter {
        schedule: Some(schedule),
        source: Some(source),
        from: Some(date),
        to: Some(date),
        ..Default::default()
      })
      .await
      .map_err(persistence)
  }

  /// Whether `definition` has a snapshot from `source` for the month
  /// containing `date`.
  pub async fn exists_for(&self, definition: &str, date: &str, source: Source) -> Result<bool> {
    let definition = self.registry.require(definition)?;
    let key = SnapshotKey {
      definition: definition.key.clone(),
      snapshot_date: first_of_month(parse_reference_date("date", date)?),
      source,
    };
    self
      .store
      .snapshot_exists(SnapshotFilter::for_key(&key))
      .await
      .map_err(persistence)
  }

  // ── Reads & deletion ──────────────────────────────────────────────────

  pub async fn snapshot(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>> {
    self.store.get_snapshot(snapshot_id).await.map_err(persistence)
  }

  pub async fn list(&self, filter: SnapshotFilter) -> Result<Vec<Snapshot>> {
    self.store.list_snapshots(filter).await.map_err(persistence)
  }

  pub async fn facts(&self, snapshot_id: Uuid) -> Result<Vec<FactRow>> {
    self.store.get_facts(snapshot_id).await.map_err(persistence)
  }

  pub async fn kpis(&self, snapshot_id: Uuid) -> Result<Vec<KpiMetric>> {
    self.store.get_kpis(snapshot_id).await.map_err(persistence)
  }

  /// Explicitly delete a snapshot with its fact and KPI rows.
  pub async fn delete(&self, snapshot_id: Uuid) -> Result<bool> {
    let deleted = self.store.delete_snapshot(snapshot_id).await.map_err(persistence)?;
    if deleted {
      info!(%snapshot_id, "snapshot deleted");
    }
    Ok(deleted)
  }

  // ── Retention ─────────────────────────────────────────────────────────

  /// Remove snapshots older than the retention window. Returns the number of
  /// headers removed; `0` when retention is disabled.
  pub async fn prune(&self) -> Result<u64> { self.prune_at(self.today()).await }

  async fn prune_at(&self, today: NaiveDate) -> Result<u64> {
    let Some(cutoff) = self.retention.cutoff(today) else {
      return Ok(0);
    };
    let removed = self.store.prune_before(cutoff).await.map_err(persistence)?;
    if removed > 0 {
      info!(%cutoff, removed, "pruned expired snapshots");
    }
    Ok(removed)
  }

  /// The trailing pruning step of a capture. Failures are logged only; they
  /// never undo what the capture wrote.
  async fn prune_quietly(&self, today: NaiveDate) -> Option<u64> {
    if !self.retention.is_enabled() {
      return None;
    }
    match self.prune_at(today).await {
      Ok(removed) => Some(removed),
      Err(e) => {
        warn!(error = %e, "retention pruning failed");
        None
      }
    }
  }
}

/// Parse, merge and range-check a payload's rows for `definition`.
fn payload_facts(definition: &Definition, payload: &ImportPayload) -> Result<Vec<FactRow>> {
  let facts = merge_by_label(&definition.schema, aggregate::from_payload(definition, payload)?);
  aggregate::ensure_finite(definition, &facts)?;
  Ok(facts)
}

fn persistence<E>(e: E) -> Error
where
  E: std::error::Error + Send + Sync + 'static,
{
  Error::Persistence(Box::new(e))
}
