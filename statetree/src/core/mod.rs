//! Deterministic, pure logic shared by the state engine.
//!
//! Core modules hold no locks and run no async code. They operate on
//! in-memory values and return deterministic outputs suitable for tests.

pub mod action;
pub mod graph;
pub mod invariants;
pub mod location;
pub mod path;
pub mod value;
