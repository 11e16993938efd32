//! I/O adapters for the test runner.

pub mod config;
pub mod engine;
pub mod loader;
pub mod simulated;
pub mod state_store;
pub mod variables;
