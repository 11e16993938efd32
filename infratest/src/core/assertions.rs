//! Assertion evaluation against a plan or an applied state.

use serde_json::Value;

use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::expr::{EvalContext, NS_DATA, NS_OUTPUT, NS_RESOURCE, NS_RUN, NS_VAR};
use crate::core::module::{ModuleConfig, Rule};
use crate::core::state::{ResourceMode, State};
use crate::core::types::Status;
use crate::core::variables::InputValues;

/// Everything an `assert` condition can refer to.
pub struct AssertionScope<'a> {
    /// Module configuration with test-only variables injected.
    pub config: &'a ModuleConfig,
    pub variables: &'a InputValues,
    pub run_outputs: Value,
    /// Planned state for plan runs, applied state otherwise.
    pub state: &'a State,
}

impl AssertionScope<'_> {
    fn context(&self) -> EvalContext {
        let vars = self
            .variables
            .iter()
            .filter(|(name, _)| self.config.variables.contains_key(*name))
            .map(|(name, value)| (name.clone(), value.value.clone()))
            .collect();
        EvalContext::new()
            .with_namespace(NS_RUN, self.run_outputs.clone())
            .with_namespace(NS_VAR, Value::Object(vars))
            .with_namespace(NS_OUTPUT, self.state.outputs_object())
            .with_namespace(NS_RESOURCE, self.state.resources_object(ResourceMode::Managed))
            .with_namespace(NS_DATA, self.state.resources_object(ResourceMode::Data))
    }
}

/// Evaluate every rule. No rules means the run passes.
pub fn evaluate_assertions(rules: &[Rule], scope: &AssertionScope<'_>) -> (Status, Diagnostics) {
    let ctx = scope.context();
    let mut status = Status::Pass;
    let mut diags = Diagnostics::new();
    for rule in rules {
        match ctx.evaluate(&rule.condition) {
            Ok(Value::Bool(true)) => {}
            Ok(Value::Bool(false)) => {
                status = status.merge(Status::Fail);
                diags.push(Diagnostic::error(
                    "Test assertion failed",
                    rule.error_message.clone(),
                ));
            }
            Ok(other) => {
                status = status.merge(Status::Error);
                diags.push(Diagnostic::error(
                    "Invalid condition result",
                    format!("Assertion conditions must evaluate to a bool, got {other}."),
                ));
            }
            Err(err) => {
                status = status.merge(Status::Error);
                diags.push(Diagnostic::error(
                    "Invalid assertion condition",
                    format!("Could not evaluate the assertion: {err}."),
                ));
            }
        }
    }
    (status, diags)
}
