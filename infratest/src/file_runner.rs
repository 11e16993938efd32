//! Executes the run blocks of one test file in order.
//!
//! The runner owns the file's [`StateTracker`]. Engine calls run on blocking
//! workers with cloned snapshots of configuration and state while the runner
//! waits on the call, the stop signal and the cancel signal together.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, instrument, warn};

use crate::core::assertions::{AssertionScope, evaluate_assertions};
use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::expected::{
    ExpectedFailures, check_problematic_plan_errors, without_check_block_diagnostics,
};
use crate::core::module::{ModuleConfig, SuiteConfig};
use crate::core::plan::{Plan, PlanOptions};
use crate::core::state::State;
use crate::core::suite::{Run, TestFile};
use crate::core::testfile::{FileConfig, RunCommand, RunConfig};
use crate::core::tracker::{MAIN_STATE_KEY, StateTracker};
use crate::core::transform::{ProviderTransform, VariableInjection};
use crate::core::types::{RunRef, Status};
use crate::core::variables::{
    build_input_variables_for_test, eval_context_for_provider_transform, eval_context_for_test,
    prepare_assertion_variables,
};
use crate::interrupt::Interrupts;
use crate::io::engine::Engine;
use crate::suite_runner::SuiteContext;
use crate::view::{FatalInterruptSummary, View};

/// The engine call being waited on, for interrupt reporting.
#[derive(Clone, Copy)]
pub(crate) struct InFlight<'a> {
    pub file: &'a str,
    pub run: &'a RunRef,
    pub created: &'a [String],
}

/// Result of waiting on one engine call.
pub(crate) struct Waited<T> {
    /// `None` only if the worker itself failed.
    pub output: Option<T>,
    /// Interruption and worker-failure diagnostics.
    pub diagnostics: Diagnostics,
}

enum Wake<T> {
    Done(Result<T, JoinError>),
    Stopped,
    Cancelled,
}

pub struct FileRunner<'a, E: Engine, V: View> {
    pub(crate) suite: &'a SuiteContext<E, V>,
    pub(crate) states: StateTracker,
}

impl<'a, E: Engine, V: View> FileRunner<'a, E, V> {
    pub fn new(suite: &'a SuiteContext<E, V>) -> Self {
        Self {
            suite,
            states: StateTracker::new(),
        }
    }

    pub fn states(&self) -> &StateTracker {
        &self.states
    }

    fn interrupts(&self) -> &Interrupts {
        &self.suite.interrupts
    }

    /// Run every block of `file` in declaration order, updating tracked state
    /// between runs, then report the file and its runs.
    ///
    /// A hard cancel returns immediately and reports nothing.
    #[instrument(skip_all, fields(file = %file.name))]
    pub async fn execute_file(&mut self, file: &mut TestFile, config: &mut SuiteConfig) {
        debug!("executing test file");
        file.status = file.status.merge(Status::Pass);

        let TestFile {
            name,
            config: file_config,
            runs,
            status,
            ..
        } = &mut *file;
        for run in runs {
            if self.interrupts().is_cancelled() {
                return;
            }
            if self.interrupts().is_stopped() || *status == Status::Error {
                run.status = Status::Skip;
                *status = status.merge(Status::Skip);
                continue;
            }

            let key = match run.config.module_source() {
                None => MAIN_STATE_KEY.to_string(),
                Some(source) if source == MAIN_STATE_KEY => {
                    error!(run = %run.name, "module source collides with the root state key");
                    run.diagnostics.push(Diagnostic::error(
                        "Invalid module source",
                        format!(
                            "The source for the selected module evaluated to {source:?}, which \
                             collides with the root module state. This is a bug in the test \
                             runner."
                        ),
                    ));
                    run.status = Status::Error;
                    *status = status.merge(Status::Error);
                    continue;
                }
                Some(source) => source.to_string(),
            };
            let module = if key == MAIN_STATE_KEY {
                &mut config.root
            } else if let Some(module) = config.modules.get_mut(&key) {
                module
            } else {
                run.diagnostics.push(Diagnostic::error(
                    "Module not loaded",
                    format!(
                        "The module {key} targeted by run {:?} could not be loaded.",
                        run.name
                    ),
                ));
                run.status = Status::Error;
                *status = status.merge(Status::Error);
                continue;
            };

            let prior = self.states.ensure(&key).state.clone();
            let (state, updated) = self
                .execute_run(run, file_config, name, prior, module)
                .await;
            if updated {
                match self.suite.engine.normalize_state(&state) {
                    Ok(normalized) => self.states.record(&key, run.run_ref(), normalized),
                    Err(err) => {
                        error!(run = %run.name, error = %err, "state normalization failed");
                        // Keep the raw state so cleanup can still destroy it. The
                        // error status skips every later run of the file.
                        self.states.record(&key, run.run_ref(), state);
                        run.diagnostics.push(Diagnostic::error(
                            "Failure during state serialization",
                            err.to_string(),
                        ));
                        run.status = run.status.merge(Status::Error);
                    }
                }
            }
            *status = status.merge(run.status);
        }

        self.suite.view.file(file);
        for run in &file.runs {
            self.suite.view.run(run, file);
        }
    }

    /// Drive one run through validate, plan and, for apply runs, apply.
    ///
    /// Returns the state to track and whether it was updated.
    #[instrument(skip_all, fields(run = %run.name))]
    async fn execute_run(
        &self,
        run: &mut Run,
        file: &FileConfig,
        file_name: &str,
        state: State,
        config: &mut ModuleConfig,
    ) -> (State, bool) {
        debug!("executing run block");
        if self.interrupts().is_cancelled() {
            return (state, false);
        }
        if self.interrupts().is_stopped() {
            run.status = Status::Skip;
            return (state, false);
        }

        run.diagnostics.extend(file.validate());
        if run.diagnostics.has_errors() {
            run.status = Status::Error;
            return (state, false);
        }
        run.diagnostics.extend(run.config.validate());
        if run.diagnostics.has_errors() {
            run.status = Status::Error;
            return (state, false);
        }

        let (ctx, eval_diags) = eval_context_for_provider_transform(
            &self.states,
            Some(&run.config),
            Some(file),
            &config.variables,
            &self.suite.globals,
        );
        let failed = eval_diags.has_errors();
        run.diagnostics.extend(eval_diags);
        if failed {
            run.status = Status::Error;
            return (state, false);
        }

        let (mut transformed, transform_diags) =
            ProviderTransform::apply(config, &file.providers, &ctx);
        let failed = transform_diags.has_errors();
        run.diagnostics.extend(transform_diags);
        if failed {
            run.status = Status::Error;
            return (state, false);
        }

        let run_ref = run.run_ref();
        let flight = InFlight {
            file: file_name,
            run: &run_ref,
            created: &[],
        };
        let validate_diags = self.validate(&transformed, flight).await;
        let failed = validate_diags.has_errors();
        run.diagnostics.extend(validate_diags);
        if failed {
            run.status = Status::Error;
            return (state, false);
        }

        let (plan, plan_diags) = self
            .plan(&transformed, &state, &run.config, file, flight)
            .await;
        let expected = ExpectedFailures::from_run(&run.config);

        if run.config.command == RunCommand::Plan {
            let plan_diags = expected.validate(plan_diags);
            let failed = plan_diags.has_errors();
            run.diagnostics.extend(plan_diags);
            if failed {
                run.status = Status::Error;
                return (state, false);
            }
            let Some(plan) = plan else {
                // Expected failures consumed the errors that stopped the plan.
                if !run.config.assertions.is_empty() {
                    run.diagnostics.push(Diagnostic::warning(
                        "Assertions skipped",
                        format!(
                            "No plan was produced for {file_name}/{}, so its assertions were not \
                             evaluated.",
                            run.name
                        ),
                    ));
                }
                run.status = run.status.merge(Status::Pass);
                return (state, false);
            };
            self.assert(run, file, file_name, &mut transformed, &plan, &plan.planned_state);
            return (state, false);
        }

        let plan_diags = check_problematic_plan_errors(&expected, plan_diags);
        let failed = plan_diags.has_errors();
        run.diagnostics.extend(plan_diags);
        let Some(plan) = plan.filter(|_| !failed) else {
            run.status = Status::Error;
            return (state, false);
        };

        // Apply re-evaluates check blocks.
        run.diagnostics = without_check_block_diagnostics(std::mem::take(&mut run.diagnostics));

        let created = plan.created();
        let flight = InFlight {
            created: &created,
            ..flight
        };
        let (updated, apply_diags) = self.apply(&plan, &transformed, flight).await;
        let apply_diags = expected.validate(apply_diags);
        let failed = apply_diags.has_errors();
        run.diagnostics.extend(apply_diags);
        if failed {
            // Partial progress is still tracked so cleanup can act on it.
            run.status = Status::Error;
            return (updated, true);
        }

        self.assert(run, file, file_name, &mut transformed, &plan, &updated);
        (updated, true)
    }

    /// Evaluate the run's assertions against `state`, with test-only variables
    /// injected into `config` for the duration.
    fn assert(
        &self,
        run: &mut Run,
        file: &FileConfig,
        file_name: &str,
        config: &mut ModuleConfig,
        plan: &Plan,
        state: &State,
    ) {
        let (ctx, mut diags) =
            eval_context_for_test(&self.states, &config.variables, &self.suite.globals);
        let (variables, var_diags) = prepare_assertion_variables(
            Some(&run.config),
            Some(file),
            &config.variables,
            &self.suite.globals,
            &ctx,
        );
        diags.extend(var_diags);
        let failed = diags.has_errors();
        run.diagnostics.extend(diags);
        if failed {
            run.status = Status::Error;
            return;
        }

        if self.suite.verbose {
            match self.suite.engine.snapshot(plan, state) {
                Ok(verbose) => run.verbose = Some(verbose),
                Err(err) => {
                    warn!(run = %run.name, error = %err, "verbose snapshot failed");
                    run.diagnostics.push(Diagnostic::warning(
                        "Failed to print verbose output",
                        format!(
                            "infratest failed to print the verbose output for {file_name}/{}: \
                             {err:#}.",
                            run.name
                        ),
                    ));
                }
            }
        }

        let injected = VariableInjection::apply(config, &variables);
        let scope = AssertionScope {
            config: &injected,
            variables: &variables,
            run_outputs: self.states.run_outputs(),
            state,
        };
        let (status, assert_diags) = evaluate_assertions(&run.config.assertions, &scope);
        run.status = run.status.merge(status);
        run.diagnostics.extend(assert_diags);
    }

    /// Move an engine call onto a blocking worker.
    fn spawn_unit<T, F>(&self, work: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&E) -> T + Send + 'static,
    {
        let engine = Arc::clone(&self.suite.engine);
        tokio::task::spawn_blocking(move || work(engine.as_ref()))
    }

    async fn validate(&self, config: &ModuleConfig, flight: InFlight<'_>) -> Diagnostics {
        let config = config.clone();
        let handle = self.spawn_unit(move |engine| engine.validate(&config));
        let waited = self.wait(handle, flight).await;
        let mut diags = waited.diagnostics;
        diags.extend(waited.output.unwrap_or_default());
        diags
    }

    pub(crate) async fn plan(
        &self,
        config: &ModuleConfig,
        state: &State,
        run: &RunConfig,
        file: &FileConfig,
        flight: InFlight<'_>,
    ) -> (Option<Plan>, Diagnostics) {
        let (ctx, mut diags) =
            eval_context_for_test(&self.states, &config.variables, &self.suite.globals);
        let (variables, var_diags) = build_input_variables_for_test(
            Some(run),
            Some(file),
            &config.variables,
            &self.suite.globals,
            &ctx,
        );
        diags.extend(var_diags);
        if diags.has_errors() {
            return (None, diags);
        }
        self.plan_with(config, state, PlanOptions::for_run(run, variables), flight, diags)
            .await
    }

    pub(crate) async fn plan_with(
        &self,
        config: &ModuleConfig,
        state: &State,
        options: PlanOptions,
        flight: InFlight<'_>,
        mut diags: Diagnostics,
    ) -> (Option<Plan>, Diagnostics) {
        let config = config.clone();
        let state = state.clone();
        let handle = self.spawn_unit(move |engine| engine.plan(&config, &state, &options));
        let waited = self.wait(handle, flight).await;
        diags.extend(waited.diagnostics);
        let Some((plan, plan_diags)) = waited.output else {
            return (None, diags);
        };
        diags.extend(plan_diags);
        (plan, diags)
    }

    pub(crate) async fn apply(
        &self,
        plan: &Plan,
        config: &ModuleConfig,
        flight: InFlight<'_>,
    ) -> (State, Diagnostics) {
        let owned_plan = plan.clone();
        let config = config.clone();
        let handle = self.spawn_unit(move |engine| engine.apply(&owned_plan, &config));
        let waited = self.wait(handle, flight).await;
        let mut diags = waited.diagnostics;
        match waited.output {
            Some((state, apply_diags)) => {
                diags.extend(apply_diags);
                (state, diags)
            }
            None => (plan.prior_state.clone(), diags),
        }
    }

    /// Wait for `handle` while listening for interrupts.
    ///
    /// A stop lets the call finish. A cancel, whether it arrives first or
    /// after a stop, reports what was in flight, asks the engine to halt and
    /// then waits for the call to return.
    pub(crate) async fn wait<T>(&self, mut handle: JoinHandle<T>, flight: InFlight<'_>) -> Waited<T> {
        let interrupts = self.interrupts();
        debug!(file = flight.file, run = %flight.run.name, "waiting for engine call");

        let wake = tokio::select! {
            biased;
            joined = &mut handle => Wake::Done(joined),
            () = interrupts.cancelled() => Wake::Cancelled,
            () = interrupts.stopped() => Wake::Stopped,
        };
        let joined = match wake {
            Wake::Done(joined) => Some(joined),
            Wake::Cancelled => None,
            Wake::Stopped => {
                debug!("stop requested; letting the engine call finish");
                tokio::select! {
                    biased;
                    joined = &mut handle => Some(joined),
                    () = interrupts.cancelled() => None,
                }
            }
        };

        let mut diagnostics = Diagnostics::new();
        let joined = match joined {
            Some(joined) => joined,
            None => {
                self.handle_cancelled(flight);
                diagnostics.push(Diagnostic::interrupted());
                handle.await
            }
        };
        let output = match joined {
            Ok(output) => Some(output),
            Err(err) => {
                error!(error = %err, "engine worker failed");
                diagnostics.push(Diagnostic::error(
                    "Engine call failed",
                    format!("The provisioning engine stopped unexpectedly: {err}."),
                ));
                None
            }
        };
        Waited {
            output,
            diagnostics,
        }
    }

    fn handle_cancelled(&self, flight: InFlight<'_>) {
        warn!(file = flight.file, run = %flight.run.name, "engine call cancelled");
        let states = self
            .states
            .iter()
            .map(|(_, module)| (module.run.clone(), module.state.clone()))
            .collect();
        self.suite.view.fatal_interrupt_summary(&FatalInterruptSummary {
            file: flight.file,
            run: flight.run,
            states,
            created: flight.created,
        });
        self.suite.engine.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::suite::Suite;
    use crate::core::testfile::ModuleRef;
    use crate::test_support::{
        Fault, FaultyEngine, RecordingView, ViewEvent, apply_run, module_with_bucket,
        suite_context, suite_context_with,
    };

    fn single_file(runs: Vec<RunConfig>) -> TestFile {
        TestFile::new(
            "main.test.toml",
            FileConfig {
                runs,
                ..FileConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn apply_run_records_state_and_passes() {
        let ctx = suite_context(RecordingView::default());
        let mut config = SuiteConfig {
            root: module_with_bucket(),
            modules: Default::default(),
        };
        let mut file = single_file(vec![apply_run("setup", "output.bucket_name", "demo")]);
        let mut runner = FileRunner::new(&ctx);
        runner.execute_file(&mut file, &mut config).await;

        assert_eq!(file.status, Status::Pass, "{:?}", file.runs[0].diagnostics);
        assert_eq!(file.runs[0].status, Status::Pass);
        let main = runner.states().get(MAIN_STATE_KEY).expect("main");
        assert_eq!(main.run.as_ref().map(|run| run.name.as_str()), Some("setup"));
        assert!(main.state.has_managed_resources());
        assert!(matches!(
            ctx.view.events().last(),
            Some(ViewEvent::Run { name, status: Status::Pass, .. }) if name == "setup"
        ));
    }

    #[tokio::test]
    async fn errored_file_skips_remaining_runs() {
        let ctx = suite_context(RecordingView::default());
        let mut config = SuiteConfig {
            root: module_with_bucket(),
            modules: Default::default(),
        };
        let mut broken = apply_run("broken", "output.bucket_name", "demo");
        broken.module = Some(crate::core::testfile::ModuleRef {
            source: "modules/absent".to_string(),
        });
        let mut file = single_file(vec![
            broken,
            apply_run("after", "output.bucket_name", "demo"),
        ]);
        let mut runner = FileRunner::new(&ctx);
        runner.execute_file(&mut file, &mut config).await;

        assert_eq!(file.runs[0].status, Status::Error);
        assert_eq!(file.runs[0].diagnostics.summaries(), vec!["Module not loaded"]);
        assert_eq!(file.runs[1].status, Status::Skip);
        assert_eq!(file.status, Status::Error);
        let suite = Suite::new([file]);
        assert_eq!(suite.run_count(), 2);
    }

    #[tokio::test]
    async fn empty_module_source_collides_with_the_root_key() {
        let ctx = suite_context(RecordingView::default());
        let mut config = SuiteConfig {
            root: module_with_bucket(),
            modules: Default::default(),
        };
        let mut colliding = apply_run("colliding", "output.bucket_name", "demo");
        colliding.module = Some(ModuleRef {
            source: String::new(),
        });
        let mut file = single_file(vec![
            colliding,
            apply_run("after", "output.bucket_name", "demo"),
        ]);
        let mut runner = FileRunner::new(&ctx);
        runner.execute_file(&mut file, &mut config).await;

        assert_eq!(file.runs[0].status, Status::Error);
        assert_eq!(
            file.runs[0].diagnostics.summaries(),
            vec!["Invalid module source"]
        );
        assert_eq!(file.runs[1].status, Status::Skip);
        assert_eq!(file.status, Status::Error);
        let main = runner.states().get(MAIN_STATE_KEY).expect("main");
        assert!(main.run.is_none());
        assert!(main.state.is_empty());
    }

    #[tokio::test]
    async fn normalization_failure_errors_the_file_but_keeps_state_for_cleanup() {
        let engine = Arc::new(FaultyEngine::new(Fault::Normalize));
        let ctx = suite_context_with(engine, RecordingView::default());
        let mut config = SuiteConfig {
            root: module_with_bucket(),
            modules: Default::default(),
        };
        let mut file = single_file(vec![
            apply_run("setup", "output.bucket_name", "demo"),
            apply_run("after", "output.bucket_name", "demo"),
        ]);
        let mut runner = FileRunner::new(&ctx);
        runner.execute_file(&mut file, &mut config).await;

        assert_eq!(file.runs[0].status, Status::Error);
        assert!(
            file.runs[0]
                .diagnostics
                .summaries()
                .contains(&"Failure during state serialization")
        );
        assert_eq!(file.runs[1].status, Status::Skip);
        assert_eq!(file.status, Status::Error);
        let main = runner.states().get(MAIN_STATE_KEY).expect("main");
        assert_eq!(main.run.as_ref().map(|run| run.name.as_str()), Some("setup"));
        assert!(main.state.has_managed_resources());

        runner.cleanup(&mut file, &mut config).await;
        assert!(ctx.view.events().iter().any(|event| matches!(
            event,
            ViewEvent::DestroySummary { run: Some(run), remaining, .. }
                if run == "setup" && remaining.is_empty()
        )));
    }

    #[tokio::test]
    async fn verbose_runs_capture_plan_and_state() {
        let mut ctx = suite_context(RecordingView::default());
        ctx.verbose = true;
        let mut config = SuiteConfig {
            root: module_with_bucket(),
            modules: Default::default(),
        };
        let mut file = single_file(vec![apply_run("setup", "output.bucket_name", "demo")]);
        FileRunner::new(&ctx)
            .execute_file(&mut file, &mut config)
            .await;

        let verbose = file.runs[0].verbose.as_ref().expect("verbose");
        assert_eq!(verbose.plan.created(), vec!["sim_bucket.main"]);
        assert!(verbose.state.has_managed_resources());
    }

    #[tokio::test]
    async fn verbose_snapshot_failure_warns_without_changing_status() {
        let engine = Arc::new(FaultyEngine::new(Fault::Snapshot));
        let mut ctx = suite_context_with(engine, RecordingView::default());
        ctx.verbose = true;
        let mut config = SuiteConfig {
            root: module_with_bucket(),
            modules: Default::default(),
        };
        let mut file = single_file(vec![apply_run("setup", "output.bucket_name", "demo")]);
        FileRunner::new(&ctx)
            .execute_file(&mut file, &mut config)
            .await;

        let run = &file.runs[0];
        assert_eq!(run.status, Status::Pass);
        assert!(run.verbose.is_none());
        assert!(
            run.diagnostics
                .summaries()
                .contains(&"Failed to print verbose output")
        );
        assert!(!run.diagnostics.has_errors());
    }

    #[tokio::test]
    async fn hard_cancel_before_start_leaves_runs_pending() {
        let ctx = suite_context(RecordingView::default());
        ctx.interrupts.stop();
        ctx.interrupts.cancel();
        let mut config = SuiteConfig::default();
        let mut file = single_file(vec![apply_run("setup", "output.bucket_name", "demo")]);
        let mut runner = FileRunner::new(&ctx);
        runner.execute_file(&mut file, &mut config).await;

        assert_eq!(file.runs[0].status, Status::Pending);
        assert!(ctx.view.events().is_empty());
    }
}
