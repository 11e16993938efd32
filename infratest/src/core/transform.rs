//! Reversible edits to a module configuration for the duration of one run.
//!
//! Both transforms are scoped guards: the original configuration is restored
//! when the guard is dropped, on every exit path.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde_json::Value;

use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::expr::{EvalContext, Expr};
use crate::core::module::{ModuleConfig, ProviderConfig, VariableDecl, VariableType};
use crate::core::variables::InputValues;

/// Test-file provider blocks substituted into the module under test.
pub struct ProviderTransform<'a> {
    config: &'a mut ModuleConfig,
    saved: Option<BTreeMap<String, ProviderConfig>>,
}

impl<'a> ProviderTransform<'a> {
    /// Evaluate each override attribute against `ctx` and replace the module's
    /// provider block of the same name with the resulting literal values.
    pub fn apply(
        config: &'a mut ModuleConfig,
        overrides: &BTreeMap<String, ProviderConfig>,
        ctx: &EvalContext,
    ) -> (Self, Diagnostics) {
        let mut diags = Diagnostics::new();
        let saved = config.providers.clone();
        for (provider, attributes) in overrides {
            let mut evaluated = ProviderConfig::new();
            for (attribute, expr) in attributes {
                match ctx.evaluate(expr) {
                    Ok(value) => {
                        evaluated.insert(attribute.clone(), Expr::Literal(value));
                    }
                    Err(err) => diags.push(Diagnostic::error(
                        "Invalid provider configuration",
                        format!("Could not evaluate provider.{provider}.{attribute}: {err}."),
                    )),
                }
            }
            config.providers.insert(provider.clone(), evaluated);
        }
        (
            Self {
                config,
                saved: Some(saved),
            },
            diags,
        )
    }
}

impl Deref for ProviderTransform<'_> {
    type Target = ModuleConfig;

    fn deref(&self) -> &ModuleConfig {
        self.config
    }
}

impl DerefMut for ProviderTransform<'_> {
    fn deref_mut(&mut self) -> &mut ModuleConfig {
        self.config
    }
}

impl Drop for ProviderTransform<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.config.providers = saved;
        }
    }
}

/// Synthetic declarations for test-only variables, so assertions can refer to
/// values the module does not declare.
pub struct VariableInjection<'a> {
    config: &'a mut ModuleConfig,
    saved: Option<BTreeMap<String, VariableDecl>>,
}

impl<'a> VariableInjection<'a> {
    pub fn apply(config: &'a mut ModuleConfig, inputs: &InputValues) -> Self {
        let saved = config.variables.clone();
        for (name, input) in inputs {
            if config.variables.contains_key(name) {
                continue;
            }
            config.variables.insert(
                name.clone(),
                VariableDecl {
                    ty: infer_type(&input.value),
                    default: None,
                    validation: Vec::new(),
                    synthetic: true,
                },
            );
        }
        Self {
            config,
            saved: Some(saved),
        }
    }
}

impl Deref for VariableInjection<'_> {
    type Target = ModuleConfig;

    fn deref(&self) -> &ModuleConfig {
        self.config
    }
}

impl Drop for VariableInjection<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.config.variables = saved;
        }
    }
}

fn infer_type(value: &Value) -> VariableType {
    match value {
        Value::String(_) => VariableType::String,
        Value::Number(_) => VariableType::Number,
        Value::Bool(_) => VariableType::Bool,
        Value::Array(_) => VariableType::List,
        Value::Object(_) => VariableType::Map,
        Value::Null => VariableType::Any,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::NS_RUN;
    use crate::core::variables::{InputValue, ValueSource};
    use serde_json::json;

    fn module() -> ModuleConfig {
        let mut module = ModuleConfig::default();
        module.providers.insert(
            "sim".to_string(),
            ProviderConfig::from([("region".to_string(), Expr::literal("eu-west-1"))]),
        );
        module
            .variables
            .insert("name".to_string(), VariableDecl::default());
        module
    }

    #[test]
    fn provider_overrides_are_evaluated_and_restored() {
        let mut config = module();
        let original = config.clone();
        let ctx = EvalContext::new().with_namespace(NS_RUN, json!({"setup": {"region": "us-east-2"}}));
        let overrides = BTreeMap::from([(
            "sim".to_string(),
            ProviderConfig::from([("region".to_string(), Expr::reference("run.setup.region"))]),
        )]);

        {
            let (transformed, diags) = ProviderTransform::apply(&mut config, &overrides, &ctx);
            assert!(diags.is_empty());
            assert_eq!(
                transformed.providers["sim"]["region"],
                Expr::literal("us-east-2")
            );
        }
        assert_eq!(config, original);
    }

    #[test]
    fn provider_transform_restores_on_error_paths() {
        let mut config = module();
        let original = config.clone();
        let overrides = BTreeMap::from([(
            "sim".to_string(),
            ProviderConfig::from([("region".to_string(), Expr::reference("var.nope"))]),
        )]);
        let result: Result<(), String> = (|| {
            let (_guard, diags) =
                ProviderTransform::apply(&mut config, &overrides, &EvalContext::new());
            if diags.has_errors() {
                return Err("bail".to_string());
            }
            Ok(())
        })();
        assert!(result.is_err());
        assert_eq!(config, original);
    }

    #[test]
    fn injection_declares_test_only_variables_until_dropped() {
        let mut config = module();
        let inputs = InputValues::from([
            (
                "name".to_string(),
                InputValue {
                    value: json!("x"),
                    source: ValueSource::RunOverride,
                },
            ),
            (
                "expected_count".to_string(),
                InputValue {
                    value: json!(3),
                    source: ValueSource::FileOverride,
                },
            ),
        ]);
        {
            let injected = VariableInjection::apply(&mut config, &inputs);
            let decl = &injected.variables["expected_count"];
            assert!(decl.synthetic);
            assert_eq!(decl.ty, VariableType::Number);
            assert!(!injected.variables["name"].synthetic);
        }
        assert!(!config.variables.contains_key("expected_count"));
    }
}
