//! Configuration records for the barge import engine.
//!
//! All tuning knobs are loaded once at startup into the immutable structures in
//! this crate and passed by reference to the subsystems that need them. None of
//! them may change across runs of the same migration.

pub mod shared;
