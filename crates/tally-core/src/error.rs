//! Error types for `tally-core`.

use thiserror::Error;

use crate::snapshot::SnapshotKey;

/// A boxed error raised by a storage backend or source executor.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  /// Malformed date, unknown schedule or definition, or a payload of the
  /// wrong shape. Always raised before anything is written.
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// A snapshot for the same (definition, date, source) already exists.
  #[error("snapshot already exists: {0}")]
  Conflict(SnapshotKey),

  /// A configured source query could not be executed.
  #[error("acquisition failed for {definition}: {source}")]
  Acquisition {
    definition: String,
    #[source]
    source:     BoxError,
  },

  /// The atomic header + facts write failed; nothing was kept.
  #[error("persistence failed: {0}")]
  Persistence(#[source] BoxError),
}

impl Error {
  pub fn invalid(msg: impl Into<String>) -> Self { Self::InvalidInput(msg.into()) }

  pub fn is_invalid_input(&self) -> bool { matches!(self, Self::InvalidInput(_)) }

  pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
