//! Per-file map from module key to tracked infrastructure state.
//!
//! Only the file runner writes to the tracker, and only between runs. Engine
//! calls receive cloned snapshots.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::core::state::State;
use crate::core::types::RunRef;

/// Key of the root module's state. Module-under-test keys are their source
/// paths, which are never empty.
pub const MAIN_STATE_KEY: &str = "";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleState {
    /// The run that last updated `state`; `None` while the state is the
    /// initial empty snapshot.
    pub run: Option<RunRef>,
    pub state: State,
}

/// A tracked state scheduled for destruction.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupEntry {
    pub key: String,
    pub run: RunRef,
    pub state: State,
}

/// Tracked states split by what cleanup may do with them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupPlan {
    /// Owned entries, latest run first.
    pub ordered: Vec<CleanupEntry>,
    /// Non-empty states with no owning run. Never destroyed.
    pub inconsistent: Vec<(String, State)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateTracker {
    states: BTreeMap<String, ModuleState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            states: BTreeMap::from([(MAIN_STATE_KEY.to_string(), ModuleState::default())]),
        }
    }

    /// Entry for `key`, created empty on first use.
    pub fn ensure(&mut self, key: &str) -> &ModuleState {
        self.states.entry(key.to_string()).or_default()
    }

    pub fn get(&self, key: &str) -> Option<&ModuleState> {
        self.states.get(key)
    }

    pub fn record(&mut self, key: &str, run: RunRef, state: State) {
        self.states.insert(
            key.to_string(),
            ModuleState {
                run: Some(run),
                state,
            },
        );
    }

    /// Track `state` under `key` with no owning run.
    #[cfg(test)]
    pub(crate) fn insert_unowned(&mut self, key: &str, state: State) {
        self.states
            .insert(key.to_string(), ModuleState { run: None, state });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModuleState)> {
        self.states.iter().map(|(key, state)| (key.as_str(), state))
    }

    /// `{ run_name: { output: value } }` for every run that updated a state.
    pub fn run_outputs(&self) -> Value {
        let mut runs = Map::new();
        for module in self.states.values() {
            if let Some(run) = &module.run {
                runs.insert(run.name.clone(), module.state.outputs_object());
            }
        }
        Value::Object(runs)
    }

    pub fn cleanup_plan(&self) -> CleanupPlan {
        let mut plan = CleanupPlan::default();
        for (key, module) in &self.states {
            match &module.run {
                Some(run) => plan.ordered.push(CleanupEntry {
                    key: key.clone(),
                    run: run.clone(),
                    state: module.state.clone(),
                }),
                None if module.state.is_empty() => {}
                None => plan.inconsistent.push((key.clone(), module.state.clone())),
            }
        }
        plan.ordered
            .sort_by(|a, b| b.run.index.cmp(&a.run.index));
        plan
    }
}
