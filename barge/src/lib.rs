//! Import engine for relational data migrations.
//!
//! Lands file-staged snapshot data plus a durable queue of change-data-capture
//! events into a target database (YugabyteDB or Oracle), with correctness
//! under crashes, parallelism, and at-least-once delivery. Two phases:
//!
//! - **Snapshot**: staged data files are split into resumable batch files and
//!   bulk loaded in parallel ([`snapshot`]). Per-batch progress is durable in
//!   the local state store ([`state`]), and the target records every applied
//!   batch, so interrupted runs resume without re-loading anything.
//! - **Streaming**: row-level change events are read from a segmented queue
//!   ([`queue`]), partitioned by primary key across parallel channels, and
//!   applied transactionally with per-channel watermarks ([`stream`]). Events
//!   for the same row apply in order; redelivered events are dropped.
//!
//! [`pipeline::run_snapshot_import`] and [`pipeline::run_change_streaming`]
//! drive the phases; the embedding binary owns flag parsing and the terminal.

pub mod convert;
pub mod descriptor;
pub mod error;
mod macros;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod snapshot;
pub mod state;
pub mod stream;
pub mod target;
pub mod types;

pub use error::{BargeError, BargeResult, ErrorKind};
