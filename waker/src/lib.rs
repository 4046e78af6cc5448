//! Wake-cycle orchestrator for a periodically triggered autonomous agent.
//!
//! Each wake loads one versioned agent document, reconciles and selects a
//! bounded set of pending tasks, drives them through capability ports
//! (planner, tool servers, marketplaces, code host), and commits the result
//! with a compare-and-swap on the document version.
//!
//! - **[`core`]**: Pure, deterministic logic (selection, transitions,
//!   history, invariants, status projection). No I/O.
//! - **[`io`]**: Side-effecting adapters (state stores, ports, config,
//!   process and git helpers).
//!
//! Orchestration modules ([`cycle`], [`orchestrator`], [`looping`],
//! [`bootstrap`]) connect the two and back the CLI and the server.

pub mod bootstrap;
pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
