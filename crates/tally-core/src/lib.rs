//! Core types and the capture engine for Tally snapshots.
//!
//! A snapshot is an immutable, point-in-time aggregate of operational data
//! (membership counts, plan distribution, donations, event metrics) stored as
//! fact rows for trend reporting.
//!
//! This crate is deliberately free of database dependencies. Storage backends
//! implement [`store::SnapshotStore`] and [`source::SourceExecutor`]; the
//! [`engine::SnapshotEngine`] drives them.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod aggregate;
pub mod definition;
pub mod engine;
pub mod error;
pub mod kpi;
pub mod merge;
pub mod period;
pub mod retention;
pub mod snapshot;
pub mod source;
pub mod store;

pub use error::{Error, Result};
