//! Test doubles and fixtures for runner tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tempfile::TempDir;

use crate::core::diagnostics::Diagnostics;
use crate::core::expr::Expr;
use crate::core::module::{ModuleConfig, Rule};
use crate::core::plan::{Plan, PlanOptions};
use crate::core::state::{STATE_FORMAT_VERSION, State, StateError, normalize};
use crate::core::suite::{Run, Suite, TestFile, Verbose};
use crate::core::testfile::{RunCommand, RunConfig};
use crate::core::types::{RunRef, Status};
use crate::io::engine::Engine;
use crate::io::loader::{LoadedSuite, load_suite};
use crate::io::simulated::SimulatedEngine;
use crate::io::state_store::write_errored_state;
use crate::suite_runner::SuiteContext;
use crate::view::{DestroySummary, FatalInterruptSummary, View};

/// Everything a [`RecordingView`] saw, reduced to comparable values.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Abstract {
        files: usize,
        runs: usize,
    },
    Diagnostics {
        file: Option<String>,
        run: Option<String>,
        summaries: Vec<String>,
    },
    File {
        name: String,
        status: Status,
    },
    Run {
        file: String,
        name: String,
        status: Status,
        summaries: Vec<String>,
    },
    DestroySummary {
        file: String,
        run: Option<String>,
        remaining: Vec<String>,
        summaries: Vec<String>,
    },
    FatalInterruptSummary {
        file: String,
        run: String,
        created: Vec<String>,
    },
    Interrupted,
    FatalInterrupt,
    Conclusion {
        status: Status,
    },
    ErroredState {
        path: PathBuf,
        run: String,
    },
}

fn summaries(diags: &Diagnostics) -> Vec<String> {
    diags.iter().map(|diag| diag.summary.clone()).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A view that records events and writes errored-state artifacts for real.
#[derive(Debug, Default)]
pub struct RecordingView {
    events: Mutex<Vec<ViewEvent>>,
}

impl RecordingView {
    pub fn events(&self) -> Vec<ViewEvent> {
        lock(&self.events).clone()
    }

    fn push(&self, event: ViewEvent) {
        lock(&self.events).push(event);
    }
}

impl View for RecordingView {
    fn abstract_summary(&self, suite: &Suite) {
        self.push(ViewEvent::Abstract {
            files: suite.files.len(),
            runs: suite.run_count(),
        });
    }

    fn diagnostics(&self, run: Option<&Run>, file: Option<&TestFile>, diags: &Diagnostics) {
        self.push(ViewEvent::Diagnostics {
            file: file.map(|file| file.name.clone()),
            run: run.map(|run| run.name.clone()),
            summaries: summaries(diags),
        });
    }

    fn file(&self, file: &TestFile) {
        self.push(ViewEvent::File {
            name: file.name.clone(),
            status: file.status,
        });
    }

    fn run(&self, run: &Run, file: &TestFile) {
        self.push(ViewEvent::Run {
            file: file.name.clone(),
            name: run.name.clone(),
            status: run.status,
            summaries: summaries(&run.diagnostics),
        });
    }

    fn destroy_summary(&self, summary: &DestroySummary<'_>) {
        self.push(ViewEvent::DestroySummary {
            file: summary.file.name.clone(),
            run: summary.run.map(|run| run.name.clone()),
            remaining: summary
                .state
                .managed()
                .map(|instance| instance.address())
                .collect(),
            summaries: summaries(summary.diagnostics),
        });
    }

    fn fatal_interrupt_summary(&self, summary: &FatalInterruptSummary<'_>) {
        self.push(ViewEvent::FatalInterruptSummary {
            file: summary.file.to_string(),
            run: summary.run.name.clone(),
            created: summary.created.to_vec(),
        });
    }

    fn interrupted(&self) {
        self.push(ViewEvent::Interrupted);
    }

    fn fatal_interrupt(&self) {
        self.push(ViewEvent::FatalInterrupt);
    }

    fn conclusion(&self, suite: &Suite) {
        self.push(ViewEvent::Conclusion {
            status: suite.status,
        });
    }

    fn save_errored_state(
        &self,
        path: &Path,
        _file: &TestFile,
        run: &RunRef,
        state: &State,
    ) -> Result<()> {
        write_errored_state(path, state)?;
        self.push(ViewEvent::ErroredState {
            path: path.to_path_buf(),
            run: run.name.clone(),
        });
        Ok(())
    }
}

/// Engine entry points, as recorded by [`GatedEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCall {
    Validate,
    Plan,
    Apply,
}

#[derive(Debug, Default)]
struct Gate {
    open: bool,
    waiting: usize,
    seen: usize,
}

/// The simulated engine, optionally holding calls of one kind until
/// [`GatedEngine::release`] or [`Engine::stop`].
#[derive(Debug, Default)]
pub struct GatedEngine {
    inner: SimulatedEngine,
    gated: Option<EngineCall>,
    /// Calls of the gated kind let through before the gate applies.
    ungated: usize,
    gate: Mutex<Gate>,
    opened: Condvar,
    calls: Mutex<Vec<EngineCall>>,
}

impl GatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated_on(call: EngineCall) -> Self {
        Self::gated_after(call, 0)
    }

    /// Hold calls of kind `call` once `ungated` of them have gone through.
    pub fn gated_after(call: EngineCall, ungated: usize) -> Self {
        Self {
            gated: Some(call),
            ungated,
            ..Self::default()
        }
    }

    pub fn release(&self) {
        lock(&self.gate).open = true;
        self.opened.notify_all();
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }

    pub fn was_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Resolves once some call is parked at the gate.
    pub async fn blocked(&self) {
        while lock(&self.gate).waiting == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn pass(&self, call: EngineCall) {
        lock(&self.calls).push(call);
        if self.gated != Some(call) {
            return;
        }
        let mut gate = lock(&self.gate);
        gate.seen += 1;
        if gate.seen <= self.ungated {
            return;
        }
        gate.waiting += 1;
        while !gate.open {
            gate = match self.opened.wait(gate) {
                Ok(gate) => gate,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        gate.waiting -= 1;
    }
}

impl Engine for GatedEngine {
    fn validate(&self, config: &ModuleConfig) -> Diagnostics {
        self.pass(EngineCall::Validate);
        self.inner.validate(config)
    }

    fn plan(
        &self,
        config: &ModuleConfig,
        state: &State,
        options: &PlanOptions,
    ) -> (Option<Plan>, Diagnostics) {
        self.pass(EngineCall::Plan);
        self.inner.plan(config, state, options)
    }

    fn apply(&self, plan: &Plan, config: &ModuleConfig) -> (State, Diagnostics) {
        self.pass(EngineCall::Apply);
        self.inner.apply(plan, config)
    }

    fn stop(&self) {
        self.inner.stop();
        self.release();
    }
}

/// The engine step a [`FaultyEngine`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Normalize,
    Snapshot,
}

/// The simulated engine with one step that always fails.
#[derive(Debug)]
pub struct FaultyEngine {
    inner: SimulatedEngine,
    fault: Fault,
}

impl FaultyEngine {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: SimulatedEngine::new(),
            fault,
        }
    }
}

impl Engine for FaultyEngine {
    fn validate(&self, config: &ModuleConfig) -> Diagnostics {
        self.inner.validate(config)
    }

    fn plan(
        &self,
        config: &ModuleConfig,
        state: &State,
        options: &PlanOptions,
    ) -> (Option<Plan>, Diagnostics) {
        self.inner.plan(config, state, options)
    }

    fn apply(&self, plan: &Plan, config: &ModuleConfig) -> (State, Diagnostics) {
        self.inner.apply(plan, config)
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn normalize_state(&self, state: &State) -> Result<State, StateError> {
        if self.fault == Fault::Normalize {
            return Err(StateError::Version {
                found: 0,
                expected: STATE_FORMAT_VERSION,
            });
        }
        normalize(state)
    }

    fn snapshot(&self, plan: &Plan, state: &State) -> Result<Verbose> {
        if self.fault == Fault::Snapshot {
            bail!("no schema for sim_bucket");
        }
        Ok(Verbose {
            plan: plan.clone(),
            state: state.clone(),
        })
    }
}

/// A temporary working directory holding a root module and test files.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp workspace")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Load the suite with the default `tests` directory and no filters.
    pub fn load(&self) -> Result<LoadedSuite> {
        load_suite(self.dir.path(), Path::new("tests"), &[])
    }
}

/// A context over the simulated engine with default settings.
pub fn suite_context<V: View>(view: V) -> SuiteContext<SimulatedEngine, V> {
    SuiteContext::new(Arc::new(SimulatedEngine::new()), Arc::new(view))
}

pub fn suite_context_with<E: Engine, V: View>(engine: Arc<E>, view: V) -> SuiteContext<E, V> {
    SuiteContext::new(engine, Arc::new(view))
}

/// Root module with one bucket named after `var.name` (default `demo`) and a
/// `bucket_name` output.
pub fn module_with_bucket() -> ModuleConfig {
    toml::from_str(
        r#"
        [variables.name]
        type = "string"
        default = "demo"

        [providers.sim]
        region = "eu-west-1"

        [[resources]]
        type = "sim_bucket"
        name = "main"
        attributes = { name = { ref = "var.name" }, region = { ref = "provider.sim.region" } }

        [outputs.bucket_name]
        value = { ref = "resource.sim_bucket.main.name" }
        "#,
    )
    .expect("bucket module")
}

/// Assertion that `reference` equals `expected`.
pub fn assert_eq_rule(reference: &str, expected: &str) -> Rule {
    Rule {
        condition: Expr::call(
            "eq",
            vec![Expr::reference(reference), Expr::literal(json!(expected))],
        ),
        error_message: format!("{reference} did not equal {expected:?}"),
    }
}

/// An apply run asserting `reference == expected`.
pub fn apply_run(name: &str, reference: &str, expected: &str) -> RunConfig {
    let mut run: RunConfig = toml::from_str(&format!("name = {name:?}")).expect("run");
    run.assertions.push(assert_eq_rule(reference, expected));
    run
}

/// A plan-only run asserting `reference == expected`.
pub fn plan_run(name: &str, reference: &str, expected: &str) -> RunConfig {
    RunConfig {
        command: RunCommand::Plan,
        ..apply_run(name, reference, expected)
    }
}
