//! Provisioning engine abstraction.
//!
//! The [`Engine`] trait decouples test orchestration from the backend that
//! actually computes and applies changes. Calls are synchronous; the file
//! runner moves each one onto a blocking worker and waits on it alongside the
//! interrupt signals. Tests wrap the simulated engine to block or fail on
//! demand.

use anyhow::Result;

use crate::core::diagnostics::Diagnostics;
use crate::core::module::ModuleConfig;
use crate::core::plan::{Plan, PlanOptions};
use crate::core::state::{State, StateError, normalize};
use crate::core::suite::Verbose;

pub trait Engine: Send + Sync + 'static {
    /// Structural validation of a module configuration.
    fn validate(&self, config: &ModuleConfig) -> Diagnostics;

    /// Compute a plan against `state`. `None` when no plan could be produced.
    fn plan(
        &self,
        config: &ModuleConfig,
        state: &State,
        options: &PlanOptions,
    ) -> (Option<Plan>, Diagnostics);

    /// Execute a plan. The returned state reflects partial progress on failure.
    fn apply(&self, plan: &Plan, config: &ModuleConfig) -> (State, Diagnostics);

    /// Ask the in-flight call to halt at its next safe point.
    fn stop(&self);

    /// Round-trip `state` through the persisted format. Later runs and
    /// cleanup only ever see the result.
    fn normalize_state(&self, state: &State) -> Result<State, StateError> {
        normalize(state)
    }

    /// Capture what verbose output needs to render `plan` against `state`.
    fn snapshot(&self, plan: &Plan, state: &State) -> Result<Verbose> {
        Ok(Verbose {
            plan: plan.clone(),
            state: state.clone(),
        })
    }
}
