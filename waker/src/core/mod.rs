//! Deterministic, pure logic shared by the wake-cycle orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backlog;
pub mod budget;
pub mod history;
pub mod invariants;
pub mod projection;
pub mod selector;
pub mod state;
pub mod transition;
pub mod types;
