//! Deterministic, pure logic shared by the test runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod assertions;
pub mod diagnostics;
pub mod expected;
pub mod expr;
pub mod functions;
pub mod module;
pub mod plan;
pub mod state;
pub mod suite;
pub mod testfile;
pub mod tracker;
pub mod transform;
pub mod types;
pub mod variables;
