//! In-memory provisioning engine.
//!
//! Resources are plain attribute maps: creating one records its evaluated
//! attributes, destroying one removes it. This gives the runner real plan and
//! apply semantics (partial failures, undestroyable instances, cooperative
//! stop) without touching any infrastructure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::core::diagnostics::{CheckOrigin, Diagnostic, Diagnostics};
use crate::core::expr::{
    EvalContext, Expr, NS_DATA, NS_OUTPUT, NS_PROVIDER, NS_RESOURCE, NS_RUN, NS_VAR,
};
use crate::core::module::{ModuleConfig, ResourceConfig};
use crate::core::plan::{Action, Plan, PlanMode, PlanOptions, ResourceChange};
use crate::core::state::{ResourceInstance, ResourceMode, State};
use crate::core::variables::InputValues;
use crate::io::engine::Engine;

#[derive(Debug, Default)]
pub struct SimulatedEngine {
    stopped: AtomicBool,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Engine for SimulatedEngine {
    #[instrument(skip_all)]
    fn validate(&self, config: &ModuleConfig) -> Diagnostics {
        let mut diags = Diagnostics::new();

        let mut seen = BTreeSet::new();
        for resource in &config.resources {
            if !seen.insert(resource.address()) {
                diags.push(Diagnostic::error(
                    "Duplicate resource",
                    format!("A resource named {} is declared more than once.", resource.address()),
                ));
            }
        }
        let mut seen = BTreeSet::new();
        for data in &config.data {
            if !seen.insert(data.address()) {
                diags.push(Diagnostic::error(
                    "Duplicate data source",
                    format!("A data source named data.{} is declared more than once.", data.address()),
                ));
            }
        }

        for (name, decl) in &config.variables {
            let Some(default) = &decl.default else {
                continue;
            };
            if let Err(reason) = decl.ty.convert(default.clone()) {
                diags.push(Diagnostic::error(
                    "Invalid default value for variable",
                    format!("The default value of var.{name} is not valid: {reason}."),
                ));
            }
        }

        let resources: BTreeSet<String> = config.resources.iter().map(ResourceConfig::address).collect();
        let data: BTreeSet<String> = config.data.iter().map(ResourceConfig::address).collect();
        for expr in module_expressions(config) {
            for path in expr.references() {
                if let Some(diag) = check_reference(path, config, &resources, &data) {
                    diags.push(diag);
                }
            }
        }
        debug!(errors = diags.has_errors(), "validated module");
        diags
    }

    #[instrument(skip_all, fields(mode = ?options.mode))]
    fn plan(
        &self,
        config: &ModuleConfig,
        state: &State,
        options: &PlanOptions,
    ) -> (Option<Plan>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let vars = variable_values(config, &options.variables);

        if options.mode == PlanMode::Destroy {
            let changes = state
                .resources
                .values()
                .filter(|inst| inst.mode == ResourceMode::Managed)
                .map(|inst| ResourceChange {
                    address: inst.address(),
                    mode: inst.mode,
                    action: Action::Delete,
                    before: Some(inst.attributes.clone()),
                    after: None,
                })
                .collect();
            let plan = Plan {
                mode: PlanMode::Destroy,
                changes,
                prior_state: state.clone(),
                planned_state: State::new(),
                variables: options.variables.clone(),
            };
            return (Some(plan), diags);
        }

        let base = EvalContext::new().with_namespace(NS_VAR, vars.clone());
        for (name, decl) in &config.variables {
            for rule in &decl.validation {
                match base.evaluate(&rule.condition) {
                    Ok(Value::Bool(true)) => {}
                    Ok(Value::Bool(false)) => diags.push(
                        Diagnostic::error("Invalid value for variable", rule.error_message.clone())
                            .with_origin(CheckOrigin::variable(name)),
                    ),
                    Ok(other) => diags.push(
                        Diagnostic::error(
                            "Invalid validation condition",
                            format!("The validation of var.{name} must produce a bool, got {other}."),
                        )
                        .with_origin(CheckOrigin::variable(name)),
                    ),
                    Err(err) => diags.push(
                        Diagnostic::error(
                            "Invalid validation condition",
                            format!("Could not evaluate the validation of var.{name}: {err}."),
                        )
                        .with_origin(CheckOrigin::variable(name)),
                    ),
                }
            }
        }
        if diags.has_errors() {
            return (None, diags);
        }

        let providers = evaluate_providers(config, &base, &mut diags);
        let mut planned = state.clone();
        planned.module_outputs.clear();
        let mut changes = Vec::new();

        for data in &config.data {
            let address = format!("data.{}", data.address());
            if options.skip_refresh && state.resources.contains_key(&address) {
                continue;
            }
            let ctx = scope(&vars, &providers, &planned);
            match evaluate_attributes(&data.attributes, &ctx) {
                Ok(mut attributes) => {
                    attributes
                        .entry("id")
                        .or_insert_with(|| Value::String(address.clone()));
                    let before = state.resources.get(&address).map(|inst| inst.attributes.clone());
                    planned.resources.insert(
                        address.clone(),
                        instance(ResourceMode::Data, data, attributes.clone()),
                    );
                    changes.push(ResourceChange {
                        address,
                        mode: ResourceMode::Data,
                        action: Action::Read,
                        before,
                        after: Some(attributes),
                    });
                }
                Err(err) => diags.push(Diagnostic::error(
                    "Invalid data source attribute",
                    format!("Could not evaluate {address}: {err}."),
                )),
            }
        }

        if options.mode == PlanMode::Normal {
            let mut declared = BTreeSet::new();
            for resource in &config.resources {
                let address = resource.address();
                declared.insert(address.clone());
                let targeted = options.targets.is_empty() || options.targets.contains(&address);
                if !targeted || options.excludes.contains(&address) {
                    continue;
                }
                let ctx = scope(&vars, &providers, &planned);
                let mut attributes = match evaluate_attributes(&resource.attributes, &ctx) {
                    Ok(attributes) => attributes,
                    Err(err) => {
                        diags.push(Diagnostic::error(
                            "Invalid resource attribute",
                            format!("Could not evaluate {address}: {err}."),
                        ));
                        continue;
                    }
                };
                let prior = state.resources.get(&address);
                let id = prior
                    .and_then(|inst| inst.attributes.get("id").cloned())
                    .unwrap_or_else(|| Value::String(format!("sim-{address}")));
                attributes.insert("id".to_string(), id);

                let action = match prior {
                    None => Action::Create,
                    Some(_) if options.force_replace.contains(&address) => Action::Replace,
                    Some(prior) if prior.attributes == attributes => Action::NoOp,
                    Some(_) => Action::Update,
                };
                changes.push(ResourceChange {
                    address: address.clone(),
                    mode: ResourceMode::Managed,
                    action,
                    before: prior.map(|inst| inst.attributes.clone()),
                    after: Some(attributes.clone()),
                });
                planned
                    .resources
                    .insert(address, instance(ResourceMode::Managed, resource, attributes));
            }

            if options.targets.is_empty() {
                for (address, prior) in &state.resources {
                    if prior.mode != ResourceMode::Managed
                        || declared.contains(address)
                        || options.excludes.contains(address)
                    {
                        continue;
                    }
                    changes.push(ResourceChange {
                        address: address.clone(),
                        mode: ResourceMode::Managed,
                        action: Action::Delete,
                        before: Some(prior.attributes.clone()),
                        after: None,
                    });
                    planned.resources.remove(address);
                }
            }
        }

        let ctx = scope(&vars, &providers, &planned);
        planned.outputs = evaluate_outputs(config, &ctx, &mut diags);
        let ctx = ctx.with_namespace(NS_OUTPUT, planned.outputs_object());
        diags.extend(evaluate_checks(config, &ctx));

        let plan = Plan {
            mode: options.mode,
            changes,
            prior_state: state.clone(),
            planned_state: planned,
            variables: options.variables.clone(),
        };
        (Some(plan), diags)
    }

    #[instrument(skip_all, fields(mode = ?plan.mode, changes = plan.changes.len()))]
    fn apply(&self, plan: &Plan, config: &ModuleConfig) -> (State, Diagnostics) {
        let mut diags = Diagnostics::new();
        let mut state = plan.prior_state.clone();
        let declared: BTreeMap<String, &ResourceConfig> = config
            .resources
            .iter()
            .map(|resource| (resource.address(), resource))
            .collect();

        for change in &plan.changes {
            if self.is_stopped() {
                warn!(address = %change.address, "apply stopped before change");
                diags.push(Diagnostic::error(
                    "Execution halted",
                    format!(
                        "The apply was stopped before {} could be changed; remaining changes were not applied.",
                        change.address
                    ),
                ));
                break;
            }
            let resource = declared.get(&change.address);
            match change.action {
                Action::NoOp => {}
                Action::Create | Action::Update | Action::Replace | Action::Read => {
                    if change.mode == ResourceMode::Managed
                        && resource.is_some_and(|resource| resource.fail_on_apply)
                    {
                        diags.push(
                            Diagnostic::error(
                                "Failed to apply resource",
                                format!("The provider reported an error while applying {}.", change.address),
                            )
                            .with_origin(CheckOrigin::resource(&change.address)),
                        );
                        continue;
                    }
                    if let Some(planned) = plan.planned_state.resources.get(&change.address) {
                        state.resources.insert(change.address.clone(), planned.clone());
                    }
                }
                Action::Delete => {
                    if resource.is_some_and(|resource| resource.prevent_destroy) {
                        diags.push(
                            Diagnostic::error(
                                "Instance cannot be destroyed",
                                format!(
                                    "Resource {} has prevent_destroy set, but the plan calls for it to be destroyed.",
                                    change.address
                                ),
                            )
                            .with_origin(CheckOrigin::resource(&change.address)),
                        );
                        continue;
                    }
                    state.resources.remove(&change.address);
                }
            }
        }

        if plan.mode == PlanMode::Destroy {
            state
                .resources
                .retain(|_, inst| inst.mode == ResourceMode::Managed);
            state.outputs.clear();
            state.module_outputs.clear();
            return (state, diags);
        }

        let vars = variable_values(config, &plan.variables);
        let base = EvalContext::new().with_namespace(NS_VAR, vars.clone());
        let mut provider_diags = Diagnostics::new();
        let providers = evaluate_providers(config, &base, &mut provider_diags);
        let ctx = scope(&vars, &providers, &state);
        if diags.has_errors() {
            // Partial state: keep whatever outputs still evaluate.
            let mut ignored = Diagnostics::new();
            state.outputs = evaluate_outputs(config, &ctx, &mut ignored);
        } else {
            state.outputs = evaluate_outputs(config, &ctx, &mut diags);
            let ctx = ctx.with_namespace(NS_OUTPUT, state.outputs_object());
            diags.extend(evaluate_checks(config, &ctx));
        }
        (state, diags)
    }

    fn stop(&self) {
        debug!("stop requested");
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn instance(mode: ResourceMode, config: &ResourceConfig, attributes: Map<String, Value>) -> ResourceInstance {
    ResourceInstance {
        mode,
        ty: config.ty.clone(),
        name: config.name.clone(),
        attributes,
    }
}

fn variable_values(config: &ModuleConfig, inputs: &InputValues) -> Value {
    let mut vars = Map::new();
    for (name, decl) in &config.variables {
        let value = inputs
            .get(name)
            .map(|input| input.value.clone())
            .or_else(|| decl.default.clone())
            .unwrap_or(Value::Null);
        vars.insert(name.clone(), value);
    }
    Value::Object(vars)
}

fn scope(vars: &Value, providers: &Value, state: &State) -> EvalContext {
    EvalContext::new()
        .with_namespace(NS_VAR, vars.clone())
        .with_namespace(NS_PROVIDER, providers.clone())
        .with_namespace(NS_RESOURCE, state.resources_object(ResourceMode::Managed))
        .with_namespace(NS_DATA, state.resources_object(ResourceMode::Data))
}

fn evaluate_attributes(
    attributes: &BTreeMap<String, Expr>,
    ctx: &EvalContext,
) -> Result<Map<String, Value>, crate::core::expr::ExprError> {
    attributes
        .iter()
        .map(|(name, expr)| Ok((name.clone(), ctx.evaluate(expr)?)))
        .collect()
}

fn evaluate_providers(config: &ModuleConfig, ctx: &EvalContext, diags: &mut Diagnostics) -> Value {
    let mut providers = Map::new();
    for (name, attributes) in &config.providers {
        match evaluate_attributes(attributes, ctx) {
            Ok(values) => {
                providers.insert(name.clone(), Value::Object(values));
            }
            Err(err) => diags.push(Diagnostic::error(
                "Invalid provider configuration",
                format!("Could not configure provider {name}: {err}."),
            )),
        }
    }
    Value::Object(providers)
}

fn evaluate_outputs(
    config: &ModuleConfig,
    ctx: &EvalContext,
    diags: &mut Diagnostics,
) -> BTreeMap<String, Value> {
    let mut outputs = BTreeMap::new();
    for (name, output) in &config.outputs {
        match ctx.evaluate(&output.value) {
            Ok(value) => {
                outputs.insert(name.clone(), value);
            }
            Err(err) => diags.push(
                Diagnostic::error(
                    "Invalid output value",
                    format!("Could not evaluate output.{name}: {err}."),
                )
                .with_origin(CheckOrigin::output(name)),
            ),
        }
    }
    outputs
}

fn evaluate_checks(config: &ModuleConfig, ctx: &EvalContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for check in &config.checks {
        let origin = CheckOrigin::check(&check.name);
        match ctx.evaluate(&check.condition) {
            Ok(Value::Bool(true)) => {}
            Ok(Value::Bool(false)) => diags.push(
                Diagnostic::warning("Check block assertion failed", check.error_message.clone())
                    .with_origin(origin),
            ),
            Ok(other) => diags.push(
                Diagnostic::warning(
                    "Check block assertion known after apply",
                    format!("The condition of check.{} produced {other}, not a bool.", check.name),
                )
                .with_origin(origin),
            ),
            Err(err) => diags.push(
                Diagnostic::warning(
                    "Check block assertion failed",
                    format!("Could not evaluate check.{}: {err}.", check.name),
                )
                .with_origin(origin),
            ),
        }
    }
    diags
}

fn module_expressions(config: &ModuleConfig) -> Vec<&Expr> {
    let mut exprs: Vec<&Expr> = Vec::new();
    for decl in config.variables.values() {
        exprs.extend(decl.validation.iter().map(|rule| &rule.condition));
    }
    for attributes in config.providers.values() {
        exprs.extend(attributes.values());
    }
    for resource in config.resources.iter().chain(&config.data) {
        exprs.extend(resource.attributes.values());
    }
    exprs.extend(config.outputs.values().map(|output| &output.value));
    exprs.extend(config.checks.iter().map(|check| &check.condition));
    exprs
}

fn check_reference(
    path: &str,
    config: &ModuleConfig,
    resources: &BTreeSet<String>,
    data: &BTreeSet<String>,
) -> Option<Diagnostic> {
    let mut segments = path.split('.');
    let namespace = segments.next().unwrap_or_default();
    let first = segments.next();
    let second = segments.next();
    let missing = match (namespace, first, second) {
        (NS_VAR, Some(name), _) => !config.variables.contains_key(name),
        (NS_PROVIDER, Some(name), _) => !config.providers.contains_key(name),
        (NS_RESOURCE, Some(ty), Some(name)) => !resources.contains(&format!("{ty}.{name}")),
        (NS_DATA, Some(ty), Some(name)) => !data.contains(&format!("{ty}.{name}")),
        (NS_OUTPUT, Some(name), _) => !config.outputs.contains_key(name),
        (NS_RUN, _, _) => {
            return Some(Diagnostic::error(
                "Invalid reference",
                format!("{path}: run outputs are only available in test files."),
            ));
        }
        _ => {
            return Some(Diagnostic::error(
                "Invalid reference",
                format!("{path} is not a valid reference."),
            ));
        }
    };
    missing.then(|| {
        Diagnostic::error(
            "Reference to undeclared object",
            format!("{path} refers to an object that is not declared in the module."),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variables::{InputValue, ValueSource};
    use serde_json::json;

    fn module() -> ModuleConfig {
        toml::from_str(
            r#"
            [variables.name]
            type = "string"
            default = "alpha"

            [[variables.name.validation]]
            condition = { call = "ne", args = [{ ref = "var.name" }, "invalid"] }
            error_message = "name must not be invalid"

            [providers.sim]
            region = "eu-west-1"

            [[data]]
            type = "sim_zone"
            name = "current"
            attributes = { region = { ref = "provider.sim.region" } }

            [[resources]]
            type = "sim_bucket"
            name = "main"
            attributes = { name = { ref = "var.name" }, zone = { ref = "data.sim_zone.current.region" } }

            [[resources]]
            type = "sim_object"
            name = "index"
            attributes = { bucket = { ref = "resource.sim_bucket.main.name" } }

            [outputs.bucket_name]
            value = { ref = "resource.sim_bucket.main.name" }

            [[checks]]
            name = "named"
            condition = { call = "ne", args = [{ ref = "output.bucket_name" }, "beta"] }
            error_message = "bucket is beta"
            "#,
        )
        .expect("module")
    }

    fn options(name: &str) -> PlanOptions {
        PlanOptions {
            variables: InputValues::from([(
                "name".to_string(),
                InputValue {
                    value: json!(name),
                    source: ValueSource::CliLiteral,
                },
            )]),
            ..PlanOptions::default()
        }
    }

    fn apply_fresh(engine: &SimulatedEngine, config: &ModuleConfig, name: &str) -> State {
        let (plan, diags) = engine.plan(config, &State::new(), &options(name));
        assert!(!diags.has_errors(), "{diags:?}");
        let (state, diags) = engine.apply(&plan.expect("plan"), config);
        assert!(!diags.has_errors(), "{diags:?}");
        state
    }

    #[test]
    fn validate_reports_undeclared_references() {
        let engine = SimulatedEngine::new();
        assert!(engine.validate(&module()).is_empty());

        let mut broken = module();
        broken.outputs.insert(
            "extra".to_string(),
            crate::core::module::OutputConfig {
                value: Expr::reference("var.missing"),
            },
        );
        let diags = engine.validate(&broken);
        assert_eq!(diags.summaries(), vec!["Reference to undeclared object"]);
    }

    #[test]
    fn plan_then_apply_creates_resources_and_outputs() {
        let engine = SimulatedEngine::new();
        let config = module();
        let (plan, diags) = engine.plan(&config, &State::new(), &options("alpha"));
        assert!(diags.is_empty(), "{diags:?}");
        let plan = plan.expect("plan");
        assert_eq!(plan.created(), vec!["sim_bucket.main", "sim_object.index"]);

        let (state, diags) = engine.apply(&plan, &config);
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(state.outputs["bucket_name"], json!("alpha"));
        assert_eq!(
            state.resources["sim_object.index"].attributes["bucket"],
            json!("alpha")
        );
        assert_eq!(
            state.resources["sim_bucket.main"].attributes["zone"],
            json!("eu-west-1")
        );
    }

    #[test]
    fn second_plan_updates_changed_attributes() {
        let engine = SimulatedEngine::new();
        let config = module();
        let state = apply_fresh(&engine, &config, "alpha");

        let (plan, _) = engine.plan(&config, &state, &options("alpha"));
        assert!(!plan.expect("plan").has_changes());

        let (plan, diags) = engine.plan(&config, &state, &options("gamma"));
        assert!(diags.is_empty());
        let actions: Vec<Action> = plan
            .expect("plan")
            .changes
            .iter()
            .filter(|c| c.mode == ResourceMode::Managed)
            .map(|c| c.action)
            .collect();
        assert_eq!(actions, vec![Action::Update, Action::Update]);
    }

    #[test]
    fn validation_failures_carry_variable_origin() {
        let engine = SimulatedEngine::new();
        let (plan, diags) = engine.plan(&module(), &State::new(), &options("invalid"));
        assert!(plan.is_none());
        let diag = diags.iter().next().expect("diag");
        assert_eq!(diag.origin, Some(CheckOrigin::variable("name")));
    }

    #[test]
    fn failing_checks_are_warnings() {
        let engine = SimulatedEngine::new();
        let (_, diags) = engine.plan(&module(), &State::new(), &options("beta"));
        assert!(!diags.has_errors());
        assert_eq!(diags.summaries(), vec!["Check block assertion failed"]);
    }

    #[test]
    fn destroy_removes_everything_except_protected_instances() {
        let engine = SimulatedEngine::new();
        let mut config = module();
        let state = apply_fresh(&engine, &config, "alpha");
        config.resources[0].prevent_destroy = true;

        let destroy = PlanOptions {
            mode: PlanMode::Destroy,
            ..options("alpha")
        };
        let (plan, _) = engine.plan(&config, &state, &destroy);
        let (after, diags) = engine.apply(&plan.expect("plan"), &config);
        assert_eq!(diags.summaries(), vec!["Instance cannot be destroyed"]);
        assert_eq!(
            after.resources.keys().collect::<Vec<_>>(),
            vec!["sim_bucket.main"]
        );
        assert!(after.outputs.is_empty());
    }

    #[test]
    fn targets_and_excludes_limit_the_plan() {
        let engine = SimulatedEngine::new();
        let config = module();
        let targeted = PlanOptions {
            targets: vec!["sim_bucket.main".to_string()],
            ..options("alpha")
        };
        let (plan, _) = engine.plan(&config, &State::new(), &targeted);
        assert_eq!(plan.expect("plan").created(), vec!["sim_bucket.main"]);

        let excluded = PlanOptions {
            excludes: vec!["sim_bucket.main".to_string()],
            ..options("alpha")
        };
        let (plan, diags) = engine.plan(&config, &State::new(), &excluded);
        assert!(plan.is_some());
        // The object reads the excluded bucket, which does not exist yet.
        assert!(diags.has_errors());
    }

    #[test]
    fn force_replace_and_refresh_only() {
        let engine = SimulatedEngine::new();
        let config = module();
        let state = apply_fresh(&engine, &config, "alpha");

        let replace = PlanOptions {
            force_replace: vec!["sim_bucket.main".to_string()],
            ..options("alpha")
        };
        let (plan, _) = engine.plan(&config, &state, &replace);
        let plan = plan.expect("plan");
        assert!(plan.created().is_empty());
        assert!(plan.changes.iter().any(|change| {
            change.address == "sim_bucket.main" && change.action == Action::Replace
        }));

        let refresh = PlanOptions {
            mode: PlanMode::RefreshOnly,
            ..options("gamma")
        };
        let (plan, _) = engine.plan(&config, &state, &refresh);
        let plan = plan.expect("plan");
        assert!(!plan.has_changes());
        assert_eq!(
            plan.planned_state.resources["sim_bucket.main"].attributes["name"],
            json!("alpha")
        );
    }

    #[test]
    fn failed_apply_keeps_partial_state() {
        let engine = SimulatedEngine::new();
        let mut config = module();
        config.resources[1].fail_on_apply = true;
        let (plan, _) = engine.plan(&config, &State::new(), &options("alpha"));
        let (state, diags) = engine.apply(&plan.expect("plan"), &config);
        assert_eq!(diags.summaries(), vec!["Failed to apply resource"]);
        assert!(state.resources.contains_key("sim_bucket.main"));
        assert!(!state.resources.contains_key("sim_object.index"));
        assert_eq!(
            diags.iter().next().expect("diag").origin,
            Some(CheckOrigin::resource("sim_object.index"))
        );
    }

    #[test]
    fn stop_halts_apply_between_changes() {
        let engine = SimulatedEngine::new();
        let config = module();
        let (plan, _) = engine.plan(&config, &State::new(), &options("alpha"));
        engine.stop();
        let (state, diags) = engine.apply(&plan.expect("plan"), &config);
        assert_eq!(diags.summaries(), vec!["Execution halted"]);
        assert!(!state.has_managed_resources());
        assert!(engine.is_stopped());
    }
}
