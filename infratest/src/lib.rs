//! Test runner for declarative infrastructure modules.
//!
//! Test files hold ordered run blocks. Each run validates, plans and
//! optionally applies a module through a provisioning [`io::engine::Engine`],
//! then checks assertions against the plan or the resulting state. State is
//! tracked per module across the runs of a file and destroyed, latest run
//! first, once the file finishes.
//!
//! - **[`core`]**: Pure, deterministic logic (status algebra, expressions,
//!   variable precedence, state tracking, expected failures, assertions).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config and test file loading,
//!   variable sources, the engine trait and its simulated backend,
//!   errored-state artifacts).
//!
//! Orchestration modules ([`suite_runner`], [`file_runner`], [`cleanup`])
//! drive the engine, honouring the two-level [`interrupt`] protocol, and
//! report through a [`view::View`].

pub mod cleanup;
pub mod core;
pub mod exit_codes;
pub mod file_runner;
pub mod interrupt;
pub mod io;
pub mod logging;
pub mod suite_runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod view;
