//! Plans produced by the engine and the options that shape them.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::state::{ResourceMode, State};
use crate::core::testfile::{RunConfig, RunMode};
use crate::core::variables::InputValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanMode {
    #[default]
    Normal,
    RefreshOnly,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    NoOp,
    Create,
    Update,
    Replace,
    Delete,
    Read,
}

impl Action {
    pub fn symbol(self) -> &'static str {
        match self {
            Action::NoOp => " ",
            Action::Create => "+",
            Action::Update => "~",
            Action::Replace => "-/+",
            Action::Delete => "-",
            Action::Read => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceChange {
    pub address: String,
    pub mode: ResourceMode,
    pub action: Action,
    pub before: Option<Map<String, Value>>,
    pub after: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub mode: PlanMode,
    pub changes: Vec<ResourceChange>,
    pub prior_state: State,
    pub planned_state: State,
    pub variables: InputValues,
}

impl Plan {
    /// Addresses of managed resources this plan will create. Replacements are
    /// already tracked, so they are not listed.
    pub fn created(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|change| change.mode == ResourceMode::Managed)
            .filter(|change| change.action == Action::Create)
            .map(|change| change.address.clone())
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.changes
            .iter()
            .any(|change| !matches!(change.action, Action::NoOp | Action::Read))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanOptions {
    pub mode: PlanMode,
    pub targets: Vec<String>,
    pub excludes: Vec<String>,
    pub force_replace: Vec<String>,
    pub skip_refresh: bool,
    pub variables: InputValues,
}

impl PlanOptions {
    pub fn for_run(run: &RunConfig, variables: InputValues) -> Self {
        let options = &run.plan_options;
        Self {
            mode: match options.mode {
                RunMode::Normal => PlanMode::Normal,
                RunMode::RefreshOnly => PlanMode::RefreshOnly,
            },
            targets: options.target.clone(),
            excludes: options.exclude.clone(),
            force_replace: options.replace.clone(),
            skip_refresh: !options.refresh,
            variables,
        }
    }

    /// Destroy plans never target, exclude or replace.
    pub fn destroy(run: &RunConfig, variables: InputValues) -> Self {
        Self {
            mode: PlanMode::Destroy,
            targets: Vec::new(),
            excludes: Vec::new(),
            force_replace: Vec::new(),
            skip_refresh: !run.plan_options.refresh,
            variables,
        }
    }
}
