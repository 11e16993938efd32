//! Tears down what a test file created, latest run first.

use tracing::{debug, error, instrument, warn};

use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::module::{ModuleConfig, SuiteConfig};
use crate::core::plan::PlanOptions;
use crate::core::state::State;
use crate::core::suite::TestFile;
use crate::core::testfile::{FileConfig, RunConfig};
use crate::core::tracker::{CleanupEntry, MAIN_STATE_KEY};
use crate::core::transform::ProviderTransform;
use crate::core::types::CleanupOutcome;
use crate::core::variables::{build_input_variables_for_test, eval_context_for_provider_transform};
use crate::file_runner::{FileRunner, InFlight};
use crate::io::engine::Engine;
use crate::io::state_store::errored_state_path;
use crate::view::{DestroySummary, View};

impl<E: Engine, V: View> FileRunner<'_, E, V> {
    /// Destroy every tracked state of `file`.
    ///
    /// States without an owning run are reported and left alone. Owned states
    /// are destroyed in descending run order; anything that survives is saved
    /// as an errored-state artifact. A hard cancel skips cleanup entirely or
    /// stops it between states.
    #[instrument(skip_all, fields(file = %file.name))]
    pub async fn cleanup(&self, file: &mut TestFile, config: &mut SuiteConfig) -> CleanupOutcome {
        if self.suite.interrupts.is_cancelled() {
            debug!("skipping cleanup after cancellation");
            return CleanupOutcome::NotRun;
        }

        let plan = self.states.cleanup_plan();
        for (key, state) in &plan.inconsistent {
            error!(module = key.as_str(), "tracked state has no owning run");
            let diags = Diagnostics::from(Diagnostic::error(
                "Inconsistent state",
                format!(
                    "Found inconsistent state while cleaning up {}. This is a bug in the test \
                     runner; the resources it holds must be destroyed manually.",
                    file.name
                ),
            ));
            self.suite.view.destroy_summary(&DestroySummary {
                file,
                run: None,
                diagnostics: &diags,
                state,
            });
        }

        for entry in &plan.ordered {
            debug!(run = %entry.run.name, "cleaning up state");
            if self.suite.interrupts.is_cancelled() {
                warn!(run = %entry.run.name, "cleanup interrupted");
                return CleanupOutcome::Interrupted;
            }

            let (updated, diags) = self.cleanup_entry(file, entry, config).await;
            self.suite.view.destroy_summary(&DestroySummary {
                file,
                run: Some(&entry.run),
                diagnostics: &diags,
                state: &updated,
            });

            if updated.has_managed_resources() {
                let path =
                    errored_state_path(&self.suite.errored_state_dir, file.stem(), &entry.run.name);
                warn!(path = %path.display(), "resources left behind after destroy");
                if let Err(err) = self
                    .suite
                    .view
                    .save_errored_state(&path, file, &entry.run, &updated)
                {
                    error!(error = %err, "failed to save errored state");
                    let diag = Diagnostic::error(
                        "Failed to save errored state",
                        format!(
                            "Resources created by {}/{} could not be destroyed and writing \
                             them to {} failed: {err:#}.",
                            file.name,
                            entry.run.name,
                            path.display()
                        ),
                    );
                    let diags = Diagnostics::from(diag.clone());
                    self.suite.view.diagnostics(None, Some(file), &diags);
                    file.diagnostics.push(diag);
                }
            }
        }
        CleanupOutcome::Completed
    }

    async fn cleanup_entry(
        &self,
        file: &TestFile,
        entry: &CleanupEntry,
        config: &mut SuiteConfig,
    ) -> (State, Diagnostics) {
        let mut diags = Diagnostics::new();
        let Some(run) = file.runs.iter().find(|run| run.index == entry.run.index) else {
            diags.push(Diagnostic::error(
                "Inconsistent state",
                format!("Run {} is tracked but not part of {}.", entry.run.name, file.name),
            ));
            return (entry.state.clone(), diags);
        };
        let module = if entry.key == MAIN_STATE_KEY {
            &mut config.root
        } else if let Some(module) = config.modules.get_mut(&entry.key) {
            module
        } else {
            diags.push(Diagnostic::error(
                "Module not loaded",
                format!("The module {} is no longer available for cleanup.", entry.key),
            ));
            return (entry.state.clone(), diags);
        };

        let (ctx, eval_diags) = eval_context_for_provider_transform(
            &self.states,
            Some(&run.config),
            Some(&file.config),
            &module.variables,
            &self.suite.globals,
        );
        diags.extend(eval_diags);
        if diags.has_errors() {
            return (entry.state.clone(), diags);
        }

        let (transformed, transform_diags) =
            ProviderTransform::apply(module, &file.config.providers, &ctx);
        diags.extend(transform_diags);
        if diags.has_errors() {
            return (entry.state.clone(), diags);
        }

        let flight = InFlight {
            file: &file.name,
            run: &entry.run,
            created: &[],
        };
        let (updated, destroy_diags) = self
            .destroy(&transformed, &entry.state, &run.config, &file.config, flight)
            .await;
        diags.extend(destroy_diags);
        (updated, diags)
    }

    /// Plan in destroy mode against `state` and apply the result.
    pub(crate) async fn destroy(
        &self,
        config: &ModuleConfig,
        state: &State,
        run: &RunConfig,
        file: &FileConfig,
        flight: InFlight<'_>,
    ) -> (State, Diagnostics) {
        if state.is_empty() {
            return (state.clone(), Diagnostics::new());
        }

        let (ctx, mut diags) = eval_context_for_provider_transform(
            &self.states,
            Some(run),
            Some(file),
            &config.variables,
            &self.suite.globals,
        );
        if diags.has_errors() {
            return (state.clone(), diags);
        }
        let (variables, var_diags) = build_input_variables_for_test(
            Some(run),
            Some(file),
            &config.variables,
            &self.suite.globals,
            &ctx,
        );
        diags.extend(var_diags);
        if diags.has_errors() {
            return (state.clone(), diags);
        }

        let options = PlanOptions::destroy(run, variables);
        let (plan, diags) = self.plan_with(config, state, options, flight, diags).await;
        let Some(plan) = plan.filter(|_| !diags.has_errors()) else {
            return (state.clone(), diags);
        };
        let mut diags = diags;
        let (updated, apply_diags) = self.apply(&plan, config, flight).await;
        diags.extend(apply_diags);
        (updated, diags)
    }
}
