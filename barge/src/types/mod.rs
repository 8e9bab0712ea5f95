//! Core data model of the import engine.

mod batch;
mod event;
mod task;

pub use batch::{Batch, BatchState};
pub use event::{Event, EventBatch, EventCounts, EventOp};
pub use task::{FileImportState, ImportFileTask};
