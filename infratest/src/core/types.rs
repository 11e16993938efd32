//! Shared deterministic types for test execution.
//!
//! These types define stable contracts between the orchestration layers. They
//! should not depend on external state or I/O and must remain deterministic
//! across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a run block, a test file or a whole suite.
///
/// `Pending` is only an initial value: it is the identity of [`Status::merge`]
/// and never overrides anything. The remaining statuses merge to the more
/// severe of the two, ordered `Error > Fail > Skip > Pass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Pass,
    Skip,
    Fail,
    Error,
}

impl Status {
    /// Combine two statuses, keeping the more severe one.
    pub fn merge(self, other: Status) -> Status {
        match (self, other) {
            (Status::Pending, other) => other,
            (current, Status::Pending) => current,
            (current, other) if other.severity() > current.severity() => other,
            (current, _) => current,
        }
    }

    fn severity(self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::Pass => 1,
            Status::Skip => 2,
            Status::Fail => 3,
            Status::Error => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Pass => "pass",
            Status::Skip => "skip",
            Status::Fail => "fail",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-reference from tracked state to the run block that produced it.
///
/// `index` is the declaration index of the run inside its file, which drives
/// cleanup ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRef {
    pub index: usize,
    pub name: String,
}

/// Whether the cleanup pass ran for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupOutcome {
    /// Cleanup never started (hard cancel, or the file has not finished yet).
    #[default]
    NotRun,
    /// Every tracked state was visited.
    Completed,
    /// A hard cancel arrived mid-cleanup; remaining states were left untouched.
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [Status; 5] = [
        Status::Pending,
        Status::Pass,
        Status::Skip,
        Status::Fail,
        Status::Error,
    ];

    fn any_status() -> impl Strategy<Value = Status> {
        prop::sample::select(ALL.to_vec())
    }

    #[test]
    fn error_overrides_everything() {
        for status in ALL {
            assert_eq!(status.merge(Status::Error), Status::Error);
            assert_eq!(Status::Error.merge(status), Status::Error);
        }
    }

    #[test]
    fn pass_never_overrides() {
        assert_eq!(Status::Skip.merge(Status::Pass), Status::Skip);
        assert_eq!(Status::Fail.merge(Status::Pass), Status::Fail);
        assert_eq!(Status::Pending.merge(Status::Pass), Status::Pass);
    }

    #[test]
    fn skip_outranks_pass_but_not_fail() {
        assert_eq!(Status::Pass.merge(Status::Skip), Status::Skip);
        assert_eq!(Status::Skip.merge(Status::Fail), Status::Fail);
    }

    #[test]
    fn status_serializes_lowercase() {
        let raw = serde_json::to_string(&Status::Fail).expect("serialize");
        assert_eq!(raw, "\"fail\"");
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in any_status(), b in any_status()) {
            prop_assert_eq!(a.merge(b), b.merge(a));
        }

        #[test]
        fn merge_is_associative(a in any_status(), b in any_status(), c in any_status()) {
            prop_assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
        }

        #[test]
        fn pending_is_identity(a in any_status()) {
            prop_assert_eq!(Status::Pending.merge(a), a);
            prop_assert_eq!(a.merge(Status::Pending), a);
        }

        #[test]
        fn merge_is_idempotent(a in any_status()) {
            prop_assert_eq!(a.merge(a), a);
        }

        #[test]
        fn fold_is_pass_only_when_every_input_passes(
            statuses in prop::collection::vec(any_status(), 1..8)
        ) {
            let folded = statuses.iter().fold(Status::Pass, |acc, s| acc.merge(*s));
            let all_pass = statuses
                .iter()
                .all(|s| matches!(s, Status::Pass | Status::Pending));
            prop_assert_eq!(folded == Status::Pass, all_pass);
        }
    }
}
