//! Error type for `tally-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  /// A stored column could not be decoded back into its domain type.
  #[error("decode error: {0}")]
  Decode(String),

  /// The snapshot names a definition this store's registry does not know,
  /// so there is no fact table to read or write.
  #[error("unknown definition: {0}")]
  UnknownDefinition(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
