//! `tally`: capture, import and inspect snapshots from the command line.
//!
//! Reads `tally.toml` (or the path given with `--config`) layered with
//! `TALLY_*` environment variables, opens the SQLite snapshot store and, when
//! `source_path` is configured, the operational database the source queries
//! run against. Results are printed as JSON.

mod settings;

use std::{
  io::Read as _,
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tally_core::{
  Error,
  aggregate::ImportPayload,
  engine::{CaptureReport, CaptureRequest, ImportRequest, SnapshotEngine},
  period::Schedule,
  snapshot::{SnapshotFilter, Source},
};
use tally_store_sqlite::{SqliteSource, SqliteStore};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::settings::{EngineConfig, expand_tilde};

type Engine = SnapshotEngine<SqliteStore, SqliteSource>;

#[derive(Parser)]
#[command(author, version, about = "Tally snapshot engine")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tally.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Capture snapshots for the month containing the reference date.
  Capture {
    #[arg(long, default_value = "monthly")]
    schedule:    Schedule,
    #[arg(long, default_value = "manual_cli")]
    source:      Source,
    /// Definition to capture; repeatable. Defaults to every automated
    /// definition on the schedule.
    #[arg(short, long = "definition")]
    definitions: Vec<String>,
    /// Reference date (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    date:        Option<String>,
    /// Separate reference date for the source query window.
    #[arg(long)]
    period_date: Option<String>,
    /// JSON payload file (`-` for stdin) to use instead of source queries.
    #[arg(long)]
    payload:     Option<PathBuf>,
  },
  /// Store an external payload as a `manual_import` snapshot.
  Import {
    #[arg(short, long)]
    definition: String,
    #[arg(long, default_value = "monthly")]
    schedule:   String,
    /// Snapshot date (strict YYYY-MM-DD).
    #[arg(long)]
    date:       String,
    /// JSON payload file (`-` for stdin).
    payload:    PathBuf,
  },
  /// Report whether a snapshot exists for the month containing a date.
  Exists {
    #[arg(long, default_value = "monthly")]
    schedule:   Schedule,
    #[arg(long, default_value = "automated")]
    source:     Source,
    #[arg(long)]
    date:       String,
    /// Check one definition instead of the whole schedule.
    #[arg(short, long)]
    definition: Option<String>,
  },
  /// List snapshot headers.
  List {
    #[arg(short, long)]
    definition: Option<String>,
    #[arg(long)]
    schedule:   Option<Schedule>,
    #[arg(long)]
    source:     Option<Source>,
    #[arg(long)]
    from:       Option<NaiveDate>,
    #[arg(long)]
    to:         Option<NaiveDate>,
    #[arg(long)]
    limit:      Option<usize>,
  },
  /// Print a snapshot with its facts and KPIs.
  Show { snapshot_id: Uuid },
  /// Delete a snapshot with its facts and KPIs.
  Delete { snapshot_id: Uuid },
  /// Remove snapshots older than the retention window.
  Prune,
  /// List registered definitions.
  Definitions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let cfg = EngineConfig::load(&cli.config)?;
  let registry = Arc::new(cfg.registry()?);

  let store_path = expand_tilde(&cfg.store_path);
  if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = SqliteStore::open(&store_path, registry.clone())
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let queries = cfg.source_queries()?;
  let source = match &cfg.source_path {
    Some(path) => {
      let path = expand_tilde(path);
      SqliteSource::open(&path, queries)
        .await
        .with_context(|| format!("failed to open source database at {path:?}"))?
    }
    None => SqliteSource::open_in_memory(queries).await?,
  };

  let engine = SnapshotEngine::new(Arc::new(store), Arc::new(source), registry)
    .with_retention(cfg.retention())
    .with_test_flag(cfg.is_test);

  run(&engine, cli.command).await
}

async fn run(engine: &Engine, command: Command) -> anyhow::Result<()> {
  match command {
    Command::Capture { schedule, source, definitions, date, period_date, payload } => {
      let mut request = CaptureRequest::new(schedule, source);
      request.definitions = definitions;
      request.reference_date = date;
      request.period_reference_date = period_date;
      if let Some(path) = payload {
        request = request.payload(read_payload(&path)?);
      }

      let report = engine.capture(request).await?;
      print_json(&report_json(&report))?;
      let failed = report.failures().count();
      if failed > 0 {
        anyhow::bail!("{failed} of {} definitions were not captured", report.outcomes.len());
      }
    }
    Command::Import { definition, schedule, date, payload } => {
      let snapshot = engine
        .import_snapshot(ImportRequest {
          definition,
          schedule,
          snapshot_date: date,
          payload: read_payload(&payload)?,
        })
        .await?;
      print_json(&snapshot)?;
    }
    Command::Exists { schedule, source, date, definition } => {
      let exists = match definition {
        Some(definition) => engine.exists_for(&definition, &date, source).await?,
        None => engine.exists(schedule, &date, source).await?,
      };
      print_json(&json!({ "exists": exists }))?;
    }
    Command::List { definition, schedule, source, from, to, limit } => {
      let snapshots = engine
        .list(SnapshotFilter { definition, schedule, source, from, to, is_test: None, limit })
        .await?;
      for snapshot in snapshots {
        print_json(&snapshot)?;
      }
    }
    Command::Show { snapshot_id } => {
      let snapshot = engine
        .snapshot(snapshot_id)
        .await?
        .with_context(|| format!("snapshot {snapshot_id} not found"))?;
      let headers = engine
        .registry()
        .get(&snapshot.definition)
        .map(|d| d.headers())
        .unwrap_or_default();
      print_json(&json!({
        "snapshot": snapshot,
        "headers": headers,
        "facts": engine.facts(snapshot_id).await?,
        "kpis": engine.kpis(snapshot_id).await?,
      }))?;
    }
    Command::Delete { snapshot_id } => {
      if !engine.delete(snapshot_id).await? {
        anyhow::bail!("snapshot {snapshot_id} not found");
      }
    }
    Command::Prune => {
      let removed = engine.prune().await?;
      print_json(&json!({ "pruned": removed }))?;
    }
    Command::Definitions => {
      for definition in engine.registry().iter() {
        print_json(&json!({
          "key": definition.key,
          "label": definition.label,
          "mode": definition.mode,
          "schedules": definition.schedules,
          "headers": definition.headers(),
        }))?;
      }
    }
  }
  Ok(())
}

/// Read a JSON object from `path`, or from stdin when `path` is `-`.
fn read_payload(path: &Path) -> anyhow::Result<ImportPayload> {
  let raw = if path == Path::new("-") {
    let mut buf = String::new();
    std::io::stdin()
      .read_to_string(&mut buf)
      .context("failed to read payload from stdin")?;
    buf
  } else {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))?
  };

  match serde_json::from_str(&raw).context("payload is not valid JSON")? {
    Value::Object(payload) => Ok(payload),
    _ => anyhow::bail!("payload must be a JSON object keyed by dataset"),
  }
}

fn report_json(report: &CaptureReport) -> Value {
  let outcomes: Vec<Value> = report
    .outcomes
    .iter()
    .map(|outcome| match &outcome.result {
      Ok(snapshot) => json!({
        "definition": outcome.definition,
        "status": "written",
        "snapshot_id": snapshot.snapshot_id,
      }),
      Err(e @ Error::Conflict(_)) => json!({
        "definition": outcome.definition,
        "status": "conflict",
        "error": e.to_string(),
      }),
      Err(e) => json!({
        "definition": outcome.definition,
        "status": "failed",
        "error": e.to_string(),
      }),
    })
    .collect();

  json!({
    "snapshot_date": report.period.snapshot_date,
    "period": { "start": report.period.start_text(), "end": report.period.end_text() },
    "outcomes": outcomes,
    "pruned": report.pruned,
  })
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
