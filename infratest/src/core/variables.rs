//! Variable values, their sources and precedence.
//!
//! Values reach a run from five places. From highest to lowest precedence:
//! run-level override expressions, file-level override expressions, global
//! sources (CLI, variable files, environment), and the declared default.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::expr::{EvalContext, Expr, NS_RUN, NS_VAR};
use crate::core::module::{ParsingMode, VariableDecl};
use crate::core::testfile::{FileConfig, RunConfig};
use crate::core::tracker::StateTracker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "kebab-case")]
pub enum ValueSource {
    Environment,
    AutoFile(PathBuf),
    NamedFile(PathBuf),
    CliLiteral,
    RunOverride,
    FileOverride,
    ConfigDefault,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputValue {
    pub value: Value,
    pub source: ValueSource,
}

pub type InputValues = BTreeMap<String, InputValue>;

/// A variable value that has not been interpreted yet.
///
/// Raw strings (environment, `--var`) are interpreted by the declared type;
/// override expressions are evaluated against an [`EvalContext`].
#[derive(Debug, Clone, PartialEq)]
pub enum UnparsedValue {
    Environment { name: String, raw: String },
    AutoFile { path: PathBuf, value: Value },
    NamedFile { path: PathBuf, value: Value },
    CliLiteral { raw: String },
    RunOverride(Expr),
    FileOverride(Expr),
    ConfigDefault(Value),
}

impl UnparsedValue {
    pub fn source(&self) -> ValueSource {
        match self {
            UnparsedValue::Environment { .. } => ValueSource::Environment,
            UnparsedValue::AutoFile { path, .. } => ValueSource::AutoFile(path.clone()),
            UnparsedValue::NamedFile { path, .. } => ValueSource::NamedFile(path.clone()),
            UnparsedValue::CliLiteral { .. } => ValueSource::CliLiteral,
            UnparsedValue::RunOverride(_) => ValueSource::RunOverride,
            UnparsedValue::FileOverride(_) => ValueSource::FileOverride,
            UnparsedValue::ConfigDefault(_) => ValueSource::ConfigDefault,
        }
    }

    /// Interpret the value for the variable `name`.
    ///
    /// Returns `None` when the value could not be produced; the diagnostics
    /// then explain why.
    pub fn resolve(
        &self,
        name: &str,
        mode: ParsingMode,
        ctx: &EvalContext,
    ) -> (Option<InputValue>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let value = match self {
            UnparsedValue::Environment { name: env_name, raw } => {
                parse_raw(raw, mode).map_err(|err| {
                    Diagnostic::error(
                        "Invalid value for variable",
                        format!(
                            "The environment variable {env_name} does not contain a valid value \
                             for variable {name:?}: {err}."
                        ),
                    )
                })
            }
            UnparsedValue::CliLiteral { raw } => parse_raw(raw, mode).map_err(|err| {
                Diagnostic::error(
                    "Invalid value for variable",
                    format!("The value given for variable {name:?} with --var is invalid: {err}."),
                )
            }),
            UnparsedValue::AutoFile { value, .. }
            | UnparsedValue::NamedFile { value, .. }
            | UnparsedValue::ConfigDefault(value) => Ok(value.clone()),
            UnparsedValue::RunOverride(expr) | UnparsedValue::FileOverride(expr) => {
                ctx.evaluate(expr).map_err(|err| {
                    Diagnostic::error(
                        "Invalid variable value expression",
                        format!("Could not evaluate the value for variable {name:?}: {err}."),
                    )
                })
            }
        };
        match value {
            Ok(value) => (
                Some(InputValue {
                    value,
                    source: self.source(),
                }),
                diags,
            ),
            Err(diag) => {
                diags.push(diag);
                (None, diags)
            }
        }
    }
}

fn parse_raw(raw: &str, mode: ParsingMode) -> Result<Value, String> {
    match mode {
        ParsingMode::Literal => Ok(Value::String(raw.to_string())),
        ParsingMode::Expression => serde_json::from_str(raw).map_err(|err| err.to_string()),
    }
}

fn parsing_mode(decls: &BTreeMap<String, VariableDecl>, name: &str) -> ParsingMode {
    decls
        .get(name)
        .map_or(ParsingMode::Literal, |decl| decl.ty.parsing_mode())
}

/// Resolve values for declared variables, enforcing types and required values.
pub fn parse_variable_values(
    unparsed: &BTreeMap<String, UnparsedValue>,
    decls: &BTreeMap<String, VariableDecl>,
    ctx: &EvalContext,
) -> (InputValues, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut values = InputValues::new();

    for (name, raw) in unparsed {
        let Some(decl) = decls.get(name) else {
            diags.push(Diagnostic::warning(
                "Value for undeclared variable",
                format!("A value was given for {name:?}, which is not declared by the module."),
            ));
            continue;
        };
        let (value, value_diags) = raw.resolve(name, decl.ty.parsing_mode(), ctx);
        diags.extend(value_diags);
        let Some(mut value) = value else {
            continue;
        };
        match decl.ty.convert(value.value) {
            Ok(converted) => {
                value.value = converted;
                values.insert(name.clone(), value);
            }
            Err(reason) => diags.push(Diagnostic::error(
                "Invalid value for input variable",
                format!("The given value is not suitable for var.{name}: {reason}."),
            )),
        }
    }

    for (name, decl) in decls {
        if values.contains_key(name) || unparsed.contains_key(name) {
            continue;
        }
        match &decl.default {
            Some(default) => {
                values.insert(
                    name.clone(),
                    InputValue {
                        value: default.clone(),
                        source: ValueSource::ConfigDefault,
                    },
                );
            }
            None => diags.push(Diagnostic::error(
                "No value for required variable",
                format!(
                    "The module input variable {name:?} is not set, and has no default value. \
                     Use a --var or --var-file command line argument or a variables block in \
                     the test file to provide a value for this variable."
                ),
            )),
        }
    }

    (values, diags)
}

/// Resolve every given value, declared or not, then fill declared defaults.
pub fn parse_and_apply_default_values(
    unparsed: &BTreeMap<String, UnparsedValue>,
    decls: &BTreeMap<String, VariableDecl>,
    ctx: &EvalContext,
) -> (InputValues, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut values = InputValues::new();
    for (name, raw) in unparsed {
        let (value, value_diags) = raw.resolve(name, parsing_mode(decls, name), ctx);
        diags.extend(value_diags);
        if let Some(value) = value {
            values.insert(name.clone(), value);
        }
    }
    for (name, decl) in decls {
        if unparsed.contains_key(name) {
            continue;
        }
        if let Some(default) = &decl.default {
            values.insert(
                name.clone(),
                InputValue {
                    value: default.clone(),
                    source: ValueSource::ConfigDefault,
                },
            );
        }
    }
    (values, diags)
}

/// Values for the variables the module declares, picked by precedence.
pub fn build_input_variables_for_test(
    run: Option<&RunConfig>,
    file: Option<&FileConfig>,
    decls: &BTreeMap<String, VariableDecl>,
    globals: &BTreeMap<String, UnparsedValue>,
    ctx: &EvalContext,
) -> (InputValues, Diagnostics) {
    let mut unparsed = BTreeMap::new();
    for name in decls.keys() {
        let chosen = run
            .and_then(|run| run.variables.get(name))
            .map(|expr| UnparsedValue::RunOverride(expr.clone()))
            .or_else(|| {
                file.and_then(|file| file.variables.get(name))
                    .map(|expr| UnparsedValue::FileOverride(expr.clone()))
            })
            .or_else(|| globals.get(name).cloned());
        if let Some(value) = chosen {
            unparsed.insert(name.clone(), value);
        }
    }
    parse_variable_values(&unparsed, decls, ctx)
}

/// Every variable visible to assertions: run, file and global values whether
/// or not the module declares them, plus declared defaults.
pub fn prepare_assertion_variables(
    run: Option<&RunConfig>,
    file: Option<&FileConfig>,
    decls: &BTreeMap<String, VariableDecl>,
    globals: &BTreeMap<String, UnparsedValue>,
    ctx: &EvalContext,
) -> (InputValues, Diagnostics) {
    let mut unparsed: BTreeMap<String, UnparsedValue> = BTreeMap::new();
    if let Some(run) = run {
        for (name, expr) in &run.variables {
            unparsed.insert(name.clone(), UnparsedValue::RunOverride(expr.clone()));
        }
    }
    if let Some(file) = file {
        for (name, expr) in &file.variables {
            unparsed
                .entry(name.clone())
                .or_insert_with(|| UnparsedValue::FileOverride(expr.clone()));
        }
    }
    for (name, value) in globals {
        unparsed
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }
    parse_and_apply_default_values(&unparsed, decls, ctx)
}

/// Context for override expressions: outputs of runs that already updated
/// tracked state, and global values with declared defaults.
pub fn eval_context_for_test(
    tracker: &StateTracker,
    decls: &BTreeMap<String, VariableDecl>,
    globals: &BTreeMap<String, UnparsedValue>,
) -> (EvalContext, Diagnostics) {
    let (values, diags) = parse_and_apply_default_values(globals, decls, &EvalContext::new());
    let ctx = EvalContext::new()
        .with_namespace(NS_RUN, tracker.run_outputs())
        .with_namespace(NS_VAR, values_object(&values));
    (ctx, diags)
}

/// Context used to evaluate provider overrides from the test file. The `var`
/// namespace also carries the run/file overrides that resolved to a non-null
/// value.
pub fn eval_context_for_provider_transform(
    tracker: &StateTracker,
    run: Option<&RunConfig>,
    file: Option<&FileConfig>,
    decls: &BTreeMap<String, VariableDecl>,
    globals: &BTreeMap<String, UnparsedValue>,
) -> (EvalContext, Diagnostics) {
    let (mut ctx, mut diags) = eval_context_for_test(tracker, decls, globals);
    let (values, var_diags) = build_input_variables_for_test(run, file, decls, globals, &ctx);
    diags.extend(var_diags);
    if diags.has_errors() {
        return (ctx, diags);
    }

    let mut merged = match ctx.namespace(NS_VAR) {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (name, value) in values {
        if value.value.is_null() {
            continue;
        }
        merged.insert(name, value.value);
    }
    ctx.set_namespace(NS_VAR, Value::Object(merged));
    (ctx, diags)
}

pub fn values_object(values: &InputValues) -> Value {
    Value::Object(
        values
            .iter()
            .map(|(name, value)| (name.clone(), value.value.clone()))
            .collect(),
    )
}
