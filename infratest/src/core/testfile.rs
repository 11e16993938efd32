//! Test file model (`*.test.toml`) and its structural validation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::core::diagnostics::{CheckOrigin, Diagnostic, Diagnostics};
use crate::core::expr::Expr;
use crate::core::module::{ProviderConfig, Rule};

static IDENTIFIER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").unwrap());

static RESOURCE_ADDR_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*\.[A-Za-z_][A-Za-z0-9_-]*$").unwrap()
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub variables: BTreeMap<String, Expr>,
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(rename = "run")]
    pub runs: Vec<RunConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCommand {
    #[default]
    Apply,
    Plan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleRef {
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Normal,
    RefreshOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanOptionsConfig {
    pub mode: RunMode,
    pub refresh: bool,
    pub target: Vec<String>,
    pub exclude: Vec<String>,
    pub replace: Vec<String>,
}

impl Default for PlanOptionsConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Normal,
            refresh: true,
            target: Vec::new(),
            exclude: Vec::new(),
            replace: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub name: String,
    #[serde(default)]
    pub command: RunCommand,
    #[serde(default)]
    pub module: Option<ModuleRef>,
    #[serde(default)]
    pub variables: BTreeMap<String, Expr>,
    #[serde(default)]
    pub expect_failures: Vec<String>,
    #[serde(default, rename = "assert")]
    pub assertions: Vec<Rule>,
    #[serde(default)]
    pub plan_options: PlanOptionsConfig,
}

impl FileConfig {
    /// File-level checks: run names must be unique identifiers and provider
    /// overrides must name a provider.
    pub fn validate(&self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let mut seen = BTreeSet::new();
        for run in &self.runs {
            if !seen.insert(run.name.as_str()) {
                diags.push(Diagnostic::error(
                    "Duplicate run block",
                    format!("A run block named {:?} is already declared in this file.", run.name),
                ));
            }
        }
        for name in self.providers.keys() {
            if !IDENTIFIER_RE.is_match(name) {
                diags.push(Diagnostic::error(
                    "Invalid provider name",
                    format!("{name:?} is not a valid provider name."),
                ));
            }
        }
        diags
    }
}

impl RunConfig {
    /// Run-level checks on names and addresses.
    pub fn validate(&self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        if !IDENTIFIER_RE.is_match(&self.name) {
            diags.push(Diagnostic::error(
                "Invalid run block name",
                format!(
                    "{:?} is not a valid name: names must start with a letter or underscore \
                     and contain only letters, digits, underscores and dashes.",
                    self.name
                ),
            ));
        }
        for address in &self.expect_failures {
            if CheckOrigin::parse(address).is_none() {
                diags.push(Diagnostic::error(
                    "Invalid expected failure",
                    format!(
                        "{address:?} is not a checkable object; expected var.NAME, check.NAME, \
                         output.NAME or resource.TYPE.NAME."
                    ),
                ));
            }
        }
        let options = &self.plan_options;
        for (label, addresses) in [
            ("target", &options.target),
            ("exclude", &options.exclude),
            ("replace", &options.replace),
        ] {
            for address in addresses {
                if !RESOURCE_ADDR_RE.is_match(address) {
                    diags.push(Diagnostic::error(
                        "Invalid resource address",
                        format!("{address:?} in plan_options.{label} is not a TYPE.NAME address."),
                    ));
                }
            }
        }
        if options.mode == RunMode::RefreshOnly && !options.replace.is_empty() {
            diags.push(Diagnostic::error(
                "Incompatible plan options",
                "The replace option cannot be used with the refresh-only plan mode.",
            ));
        }
        if self
            .module
            .as_ref()
            .is_some_and(|module| module.source.trim().is_empty())
        {
            diags.push(Diagnostic::error(
                "Invalid module source",
                "module.source must not be empty.",
            ));
        }
        diags
    }

    /// Key under which this run's module state is tracked.
    pub fn module_source(&self) -> Option<&str> {
        self.module.as_ref().map(|module| module.source.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> FileConfig {
        toml::from_str(raw).expect("parse test file")
    }

    #[test]
    fn parses_runs_with_defaults() {
        let file = parse(
            r#"
            [variables]
            name = "file-level"

            [[run]]
            name = "setup"

            [[run]]
            name = "verify"
            command = "plan"
            module = { source = "./modules/verify" }
            expect_failures = ["check.healthy"]
            plan_options = { mode = "refresh-only", refresh = false }

            [[run.assert]]
            condition = { call = "eq", args = [{ ref = "output.ok" }, true] }
            error_message = "not ok"
            "#,
        );

        assert_eq!(file.runs.len(), 2);
        assert_eq!(file.runs[0].command, RunCommand::Apply);
        assert!(file.runs[0].plan_options.refresh);
        let verify = &file.runs[1];
        assert_eq!(verify.command, RunCommand::Plan);
        assert_eq!(verify.module_source(), Some("./modules/verify"));
        assert_eq!(verify.plan_options.mode, RunMode::RefreshOnly);
        assert!(!verify.plan_options.refresh);
        assert_eq!(verify.assertions.len(), 1);
        assert!(file.validate().is_empty());
        assert!(verify.validate().is_empty());
    }

    #[test]
    fn duplicate_run_names_are_errors() {
        let file = parse("[[run]]\nname = \"a\"\n[[run]]\nname = \"a\"\n");
        assert_eq!(file.validate().summaries(), vec!["Duplicate run block"]);
    }

    #[test]
    fn run_validation_reports_bad_names_and_addresses() {
        let file = parse(
            r#"
            [[run]]
            name = "9lives"
            expect_failures = ["module.nope"]
            plan_options = { mode = "refresh-only", replace = ["sim_bucket"] }
            "#,
        );
        let diags = file.runs[0].validate();
        assert_eq!(
            diags.summaries(),
            vec![
                "Invalid run block name",
                "Invalid expected failure",
                "Invalid resource address",
                "Incompatible plan options",
            ]
        );
    }
}
