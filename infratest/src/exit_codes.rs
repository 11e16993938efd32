//! Stable exit codes for the `infratest` CLI.

/// Every run passed.
pub const OK: i32 = 0;
/// A run failed or errored, the suite was cancelled, or the command could not
/// start.
pub const FAILED: i32 = 1;
