//! Engine configuration as read from `tally.toml` and `TALLY_*` variables.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::Deserialize;
use tally_core::{
  definition::{DefinitionRegistry, DefinitionSpec},
  retention::RetentionPolicy,
  source::SourceQueries,
};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
  /// Where snapshots are stored.
  #[serde(default = "default_store_path")]
  pub store_path:       PathBuf,
  /// Operational database the source queries run against. Without it every
  /// query slot reads as empty.
  #[serde(default)]
  pub source_path:      Option<PathBuf>,
  #[serde(default)]
  pub retention_months: u32,
  /// Marks every snapshot written by this process as test data.
  #[serde(default)]
  pub is_test:          bool,
  /// Query slot name → SQL.
  #[serde(default)]
  pub queries:          HashMap<String, String>,
  /// Registry entries beyond the built-ins.
  #[serde(default)]
  pub definitions:      Vec<DefinitionSpec>,
}

fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/tally/snapshots.db") }

impl EngineConfig {
  /// Layer `path` (optional) under `TALLY_*` environment variables.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("TALLY").try_parsing(true))
      .build()
      .context("failed to read config file")?;

    settings
      .try_deserialize()
      .context("failed to deserialise EngineConfig")
  }

  pub fn registry(&self) -> anyhow::Result<DefinitionRegistry> {
    DefinitionRegistry::with_extra(self.definitions.iter().cloned())
      .context("invalid [[definitions]] entry")
  }

  pub fn source_queries(&self) -> anyhow::Result<SourceQueries> {
    SourceQueries::from_map(&self.queries).context("invalid [queries] table")
  }

  pub fn retention(&self) -> RetentionPolicy { RetentionPolicy::months(self.retention_months) }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
