//! Dependency-aware execution engine for an LLM-backed manuscript pipeline.
//!
//! Agents are organized into sequential layers over a dependency DAG; each
//! execution must pass a structural/semantic quality gate before dependents
//! may run. The architecture keeps a strict separation:
//!
//! - **[`core`]**: pure, deterministic logic (state model, gate validation,
//!   scheduling, cascade recomputation). No I/O, testable in isolation.
//! - **[`io`]**: side-effecting collaborators (record store, configuration,
//!   generation backend seam). Isolated to enable scripting in tests.
//!
//! The [`orchestrator`] drives one agent at a time through that core, and
//! [`jobs`] wraps it in cancellable, resumable, heartbeat-emitting background
//! runs that survive process restarts.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
