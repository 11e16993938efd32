//! Expected-failure filtering for run diagnostics.

use std::collections::BTreeSet;

use crate::core::diagnostics::{CheckOrigin, CheckableKind, Diagnostic, Diagnostics};
use crate::core::testfile::RunConfig;

/// Checkable objects a run declares it expects to fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedFailures {
    addresses: BTreeSet<String>,
}

impl ExpectedFailures {
    /// Unparseable addresses are ignored here; run validation reports them.
    pub fn from_run(run: &RunConfig) -> Self {
        Self {
            addresses: run
                .expect_failures
                .iter()
                .filter_map(|address| CheckOrigin::parse(address))
                .map(|origin| origin.address)
                .collect(),
        }
    }

    pub fn contains(&self, origin: &CheckOrigin) -> bool {
        self.addresses.contains(&origin.address)
    }

    /// Drop diagnostics raised by expected objects, then report every
    /// expected object that raised nothing.
    pub fn validate(&self, diags: Diagnostics) -> Diagnostics {
        let mut matched = BTreeSet::new();
        let mut out = Diagnostics::new();
        for diag in diags {
            let expected = diag
                .origin
                .as_ref()
                .filter(|origin| self.contains(origin));
            match expected {
                Some(origin) => {
                    matched.insert(origin.address.clone());
                }
                None => out.push(diag),
            }
        }
        for address in self.addresses.difference(&matched) {
            out.push(Diagnostic::error(
                "Missing expected failure",
                format!(
                    "The checkable object, {address}, was expected to report an error but did not."
                ),
            ));
        }
        out
    }
}

/// Warn when an expected variable validation failure stopped the plan, since
/// the apply stage then never runs.
pub fn check_problematic_plan_errors(
    expected: &ExpectedFailures,
    mut diags: Diagnostics,
) -> Diagnostics {
    let mut warnings = Vec::new();
    for diag in &diags {
        let Some(origin) = diag.origin.as_ref() else {
            continue;
        };
        if origin.kind != CheckableKind::InputVariable || !diag.is_error() {
            continue;
        }
        if expected.contains(origin) {
            warnings.push(Diagnostic::warning(
                "Invalid Variable in test file",
                format!(
                    "Variable {origin}, has an invalid value within the test. Although this was \
                     an expected failure, it has meant the apply stage was unable to run so the \
                     overall test will fail."
                ),
            ));
        }
    }
    diags.extend(warnings);
    diags
}

/// Remove diagnostics raised by check blocks; apply re-evaluates them.
pub fn without_check_block_diagnostics(mut diags: Diagnostics) -> Diagnostics {
    diags.retain(|diag| {
        !diag
            .origin
            .as_ref()
            .is_some_and(|origin| origin.kind == CheckableKind::Check)
    });
    diags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_expecting(addresses: &[&str]) -> RunConfig {
        let mut run: RunConfig = toml::from_str("name = \"r\"").expect("run");
        run.expect_failures = addresses.iter().map(|a| (*a).to_string()).collect();
        run
    }

    #[test]
    fn expected_diagnostics_are_filtered() {
        let expected = ExpectedFailures::from_run(&run_expecting(&["check.healthy"]));
        let diags: Diagnostics = [
            Diagnostic::warning("Check block assertion failed", "")
                .with_origin(CheckOrigin::check("healthy")),
            Diagnostic::error("Unrelated", ""),
        ]
        .into_iter()
        .collect();
        let out = expected.validate(diags);
        assert_eq!(out.summaries(), vec!["Unrelated"]);
    }

    #[test]
    fn unmatched_expectation_is_reported() {
        let expected = ExpectedFailures::from_run(&run_expecting(&["output.url", "var.name"]));
        let diags: Diagnostics = Diagnostic::error("Invalid value for variable", "")
            .with_origin(CheckOrigin::variable("name"))
            .into();
        let out = expected.validate(diags);
        assert_eq!(out.summaries(), vec!["Missing expected failure"]);
        assert!(out.iter().next().expect("diag").detail.contains("output.url"));
    }

    #[test]
    fn expected_variable_failure_during_plan_adds_warning() {
        let expected = ExpectedFailures::from_run(&run_expecting(&["var.name"]));
        let diags: Diagnostics = Diagnostic::error("Invalid value for variable", "")
            .with_origin(CheckOrigin::variable("name"))
            .into();
        let out = check_problematic_plan_errors(&expected, diags);
        assert_eq!(
            out.summaries(),
            vec!["Invalid value for variable", "Invalid Variable in test file"]
        );
    }

    #[test]
    fn check_block_diagnostics_are_removed_before_apply() {
        let diags: Diagnostics = [
            Diagnostic::warning("Check block assertion failed", "")
                .with_origin(CheckOrigin::check("healthy")),
            Diagnostic::warning("Output issue", "").with_origin(CheckOrigin::output("url")),
        ]
        .into_iter()
        .collect();
        let out = without_check_block_diagnostics(diags);
        assert_eq!(out.summaries(), vec!["Output issue"]);
    }
}
