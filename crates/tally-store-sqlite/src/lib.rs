//! SQLite backend for Tally snapshots.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. [`SqliteStore`] persists snapshots,
//! fact rows and KPI metrics; [`SqliteSource`] runs configured source queries
//! against an operational SQLite database.

mod encode;
mod schema;
mod source;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use source::SqliteSource;
pub use store::SqliteStore;
