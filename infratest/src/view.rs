//! Reporting sinks for test progress and results.
//!
//! Runners never print. Every user-visible event goes through [`View`]; the
//! binary picks [`HumanView`] or [`JsonView`], tests use a recording view.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::warn;

use crate::core::diagnostics::{Diagnostics, Severity};
use crate::core::plan::Action;
use crate::core::state::State;
use crate::core::suite::{Run, Suite, TestFile};
use crate::core::types::{RunRef, Status};
use crate::io::state_store::write_errored_state;

/// Outcome of tearing down one tracked state.
pub struct DestroySummary<'a> {
    pub file: &'a TestFile,
    /// `None` when the state had no owning run and was left alone.
    pub run: Option<&'a RunRef>,
    pub diagnostics: &'a Diagnostics,
    /// State left after the destroy attempt.
    pub state: &'a State,
}

/// What was in flight when a hard cancel abandoned an engine call.
pub struct FatalInterruptSummary<'a> {
    pub file: &'a str,
    pub run: &'a RunRef,
    /// Every tracked state, keyed by the run that last updated it.
    pub states: Vec<(Option<RunRef>, State)>,
    /// Resources the interrupted apply was about to create.
    pub created: &'a [String],
}

pub trait View: Send + Sync {
    /// Before anything executes.
    fn abstract_summary(&self, suite: &Suite);
    /// Diagnostics not tied to a reported run, e.g. setup warnings.
    fn diagnostics(&self, run: Option<&Run>, file: Option<&TestFile>, diags: &Diagnostics);
    fn file(&self, file: &TestFile);
    fn run(&self, run: &Run, file: &TestFile);
    fn destroy_summary(&self, summary: &DestroySummary<'_>);
    fn fatal_interrupt_summary(&self, summary: &FatalInterruptSummary<'_>);
    /// First interrupt: finishing the current operation.
    fn interrupted(&self);
    /// Second interrupt: abandoning everything.
    fn fatal_interrupt(&self);
    fn conclusion(&self, suite: &Suite);
    /// Persist leftover infrastructure for manual recovery.
    fn save_errored_state(
        &self,
        path: &Path,
        file: &TestFile,
        run: &RunRef,
        state: &State,
    ) -> Result<()>;
}

/// Counts of runs by final status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub pending: usize,
}

impl Tally {
    pub fn of(suite: &Suite) -> Self {
        let mut tally = Self::default();
        for run in suite.files.values().flat_map(|file| &file.runs) {
            match run.status {
                Status::Pass => tally.passed += 1,
                Status::Fail => tally.failed += 1,
                Status::Skip => tally.skipped += 1,
                Status::Error => tally.errored += 1,
                Status::Pending => tally.pending += 1,
            }
        }
        tally
    }
}

/// Plain text for terminals.
pub struct HumanView<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> HumanView<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, text: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            warn!(error = %err, "failed to write view output");
        }
    }

    fn render_diagnostics(diags: &Diagnostics, indent: &str) -> String {
        let mut text = String::new();
        for diag in diags {
            text.push('\n');
            for line in diag.to_string().lines() {
                text.push_str(indent);
                text.push_str(line);
                text.push('\n');
            }
        }
        text
    }

    fn render_state(state: &State, indent: &str) -> String {
        state
            .managed()
            .map(|instance| format!("{indent}- {}\n", instance.address()))
            .collect()
    }

    fn render_verbose(run: &Run) -> String {
        let Some(verbose) = &run.verbose else {
            return String::new();
        };
        let mut text = String::new();
        if !verbose.plan.has_changes() {
            text.push_str("    No changes.\n");
        }
        for change in &verbose.plan.changes {
            text.push_str(&format!(
                "    {} {}\n",
                change.action.symbol(),
                change.address
            ));
        }
        if !verbose.state.outputs.is_empty() {
            text.push_str("    outputs:\n");
            for (name, value) in &verbose.state.outputs {
                text.push_str(&format!("      {name} = {value}\n"));
            }
        }
        text
    }
}

impl<W: Write + Send> View for HumanView<W> {
    fn abstract_summary(&self, suite: &Suite) {
        self.emit(&format!(
            "Executing {} test file(s) with {} run block(s).\n\n",
            suite.files.len(),
            suite.run_count()
        ));
    }

    fn diagnostics(&self, run: Option<&Run>, file: Option<&TestFile>, diags: &Diagnostics) {
        if diags.is_empty() {
            return;
        }
        let indent = match (run.is_some(), file.is_some()) {
            (true, _) => "    ",
            (false, true) => "  ",
            (false, false) => "",
        };
        self.emit(&Self::render_diagnostics(diags, indent));
    }

    fn file(&self, file: &TestFile) {
        let mut text = format!("{}... {}\n", file.name, file.status);
        text.push_str(&Self::render_diagnostics(&file.diagnostics, "  "));
        self.emit(&text);
    }

    fn run(&self, run: &Run, _file: &TestFile) {
        let mut text = format!("  run \"{}\"... {}\n", run.name, run.status);
        text.push_str(&Self::render_verbose(run));
        text.push_str(&Self::render_diagnostics(&run.diagnostics, "    "));
        self.emit(&text);
    }

    fn destroy_summary(&self, summary: &DestroySummary<'_>) {
        let mut text = String::new();
        let target = match summary.run {
            Some(run) => format!("{}/{}", summary.file.name, run.name),
            None => summary.file.name.clone(),
        };
        if summary.diagnostics.has_errors() {
            text.push_str(&format!(
                "Errors occurred while destroying resources created by {target}.\n"
            ));
        }
        if summary.state.has_managed_resources() {
            text.push_str(&format!(
                "\nThe following resources created by {target} could not be destroyed:\n"
            ));
            text.push_str(&Self::render_state(summary.state, "  "));
        }
        text.push_str(&Self::render_diagnostics(summary.diagnostics, "  "));
        if !text.is_empty() {
            self.emit(&text);
        }
    }

    fn fatal_interrupt_summary(&self, summary: &FatalInterruptSummary<'_>) {
        let mut text = String::new();
        for (run, state) in &summary.states {
            if !state.has_managed_resources() {
                continue;
            }
            match run {
                Some(run) => text.push_str(&format!(
                    "\nThe following resources were created by {}/{} and may still exist:\n",
                    summary.file, run.name
                )),
                None => text.push_str(&format!(
                    "\nThe following resources were created by {} and may still exist:\n",
                    summary.file
                )),
            }
            text.push_str(&Self::render_state(state, "  "));
        }
        if !summary.created.is_empty() {
            text.push_str(&format!(
                "\n{}/{} was in the middle of creating:\n",
                summary.file, summary.run.name
            ));
            for address in summary.created {
                text.push_str(&format!("  - {address}\n"));
            }
        }
        if !text.is_empty() {
            self.emit(&text);
        }
    }

    fn interrupted(&self) {
        self.emit(
            "\nInterrupt received.\nPlease wait for the current operation to finish. \
             Remaining runs will be skipped and created resources destroyed.\n",
        );
    }

    fn fatal_interrupt(&self) {
        self.emit(
            "\nTwo interrupts received. Exiting immediately. Created resources may not have \
             been destroyed.\n",
        );
    }

    fn conclusion(&self, suite: &Suite) {
        let tally = Tally::of(suite);
        let failed = tally.failed + tally.errored;
        let mut text = match suite.status {
            Status::Pass => format!("\nSuccess! {} passed, {failed} failed", tally.passed),
            Status::Fail | Status::Error => {
                format!("\nFailure! {} passed, {failed} failed", tally.passed)
            }
            Status::Skip | Status::Pending => "\nExecuted 0 tests".to_string(),
        };
        if tally.skipped > 0 {
            text.push_str(&format!(", {} skipped", tally.skipped));
        }
        text.push_str(".\n");
        self.emit(&text);
    }

    fn save_errored_state(
        &self,
        path: &Path,
        _file: &TestFile,
        _run: &RunRef,
        state: &State,
    ) -> Result<()> {
        write_errored_state(path, state)?;
        self.emit(&format!("Writing state to file: {}\n", path.display()));
        Ok(())
    }
}

/// One JSON object per line, for machines.
pub struct JsonView<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonView<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: &str, body: Value) {
        let mut object = match body {
            Value::Object(map) => map,
            other => serde_json::Map::from_iter([("body".to_string(), other)]),
        };
        object.insert("type".to_string(), Value::String(event.to_string()));
        let line = match serde_json::to_string(&Value::Object(object)) {
            Ok(line) => line,
            Err(err) => {
                warn!(event, error = %err, "failed to encode view event");
                return;
            }
        };
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!(error = %err, "failed to write view output");
        }
    }
}

fn diagnostics_value(diags: &Diagnostics) -> Value {
    Value::Array(
        diags
            .iter()
            .map(|diag| {
                json!({
                    "severity": match diag.severity {
                        Severity::Error => "error",
                        Severity::Warning => "warning",
                    },
                    "summary": diag.summary,
                    "detail": diag.detail,
                    "origin": diag.origin.as_ref().map(ToString::to_string),
                })
            })
            .collect(),
    )
}

fn addresses(state: &State) -> Vec<String> {
    state.managed().map(|instance| instance.address()).collect()
}

impl<W: Write + Send> View for JsonView<W> {
    fn abstract_summary(&self, suite: &Suite) {
        let files: serde_json::Map<String, Value> = suite
            .files
            .values()
            .map(|file| {
                (
                    file.name.clone(),
                    Value::Array(
                        file.runs
                            .iter()
                            .map(|run| Value::String(run.name.clone()))
                            .collect(),
                    ),
                )
            })
            .collect();
        self.emit("test_abstract", json!({ "files": files }));
    }

    fn diagnostics(&self, run: Option<&Run>, file: Option<&TestFile>, diags: &Diagnostics) {
        if diags.is_empty() {
            return;
        }
        self.emit(
            "diagnostics",
            json!({
                "file": file.map(|file| file.name.as_str()),
                "run": run.map(|run| run.name.as_str()),
                "diagnostics": diagnostics_value(diags),
            }),
        );
    }

    fn file(&self, file: &TestFile) {
        self.emit(
            "test_file",
            json!({
                "path": file.name,
                "status": file.status,
                "diagnostics": diagnostics_value(&file.diagnostics),
            }),
        );
    }

    fn run(&self, run: &Run, file: &TestFile) {
        let verbose = run.verbose.as_ref().map(|verbose| {
            json!({
                "changes": verbose
                    .plan
                    .changes
                    .iter()
                    .filter(|change| change.action != Action::NoOp)
                    .map(|change| json!({ "address": change.address, "action": change.action }))
                    .collect::<Vec<_>>(),
                "outputs": verbose.state.outputs,
            })
        });
        self.emit(
            "test_run",
            json!({
                "path": file.name,
                "run": run.name,
                "index": run.index,
                "status": run.status,
                "diagnostics": diagnostics_value(&run.diagnostics),
                "verbose": verbose,
            }),
        );
    }

    fn destroy_summary(&self, summary: &DestroySummary<'_>) {
        self.emit(
            "test_cleanup",
            json!({
                "path": summary.file.name,
                "run": summary.run.map(|run| run.name.as_str()),
                "remaining": addresses(summary.state),
                "diagnostics": diagnostics_value(summary.diagnostics),
            }),
        );
    }

    fn fatal_interrupt_summary(&self, summary: &FatalInterruptSummary<'_>) {
        let states: Vec<Value> = summary
            .states
            .iter()
            .map(|(run, state)| {
                json!({
                    "run": run.as_ref().map(|run| run.name.as_str()),
                    "resources": addresses(state),
                })
            })
            .collect();
        self.emit(
            "test_interrupt",
            json!({
                "path": summary.file,
                "run": summary.run.name,
                "states": states,
                "planned": summary.created,
            }),
        );
    }

    fn interrupted(&self) {
        self.emit("interrupted", json!({ "hard": false }));
    }

    fn fatal_interrupt(&self) {
        self.emit("interrupted", json!({ "hard": true }));
    }

    fn conclusion(&self, suite: &Suite) {
        let tally = Tally::of(suite);
        self.emit(
            "test_summary",
            json!({
                "status": suite.status,
                "passed": tally.passed,
                "failed": tally.failed,
                "errored": tally.errored,
                "skipped": tally.skipped,
            }),
        );
    }

    fn save_errored_state(
        &self,
        path: &Path,
        file: &TestFile,
        run: &RunRef,
        state: &State,
    ) -> Result<()> {
        write_errored_state(path, state)?;
        self.emit(
            "errored_state",
            json!({
                "path": file.name,
                "run": run.name,
                "artifact": path.display().to_string(),
                "resources": addresses(state),
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::Diagnostic;
    use crate::core::testfile::FileConfig;

    fn file_with(statuses: &[Status]) -> TestFile {
        let mut config = FileConfig::default();
        for index in 0..statuses.len() {
            config.runs.push(
                toml::from_str(&format!("name = \"run{index}\"")).expect("run"),
            );
        }
        let mut file = TestFile::new("tests/main.test.toml", config);
        for (run, status) in file.runs.iter_mut().zip(statuses) {
            run.status = *status;
        }
        file.status = statuses
            .iter()
            .fold(Status::Pending, |acc, status| acc.merge(*status));
        file
    }

    fn output(view: HumanView<Vec<u8>>) -> String {
        String::from_utf8(view.into_inner()).expect("utf8")
    }

    #[test]
    fn human_conclusion_counts_runs() {
        let suite = {
            let mut suite = Suite::new([file_with(&[Status::Pass, Status::Fail, Status::Skip])]);
            suite.status = Status::Fail;
            suite
        };
        let view = HumanView::new(Vec::new());
        view.conclusion(&suite);
        assert_eq!(output(view), "\nFailure! 1 passed, 1 failed, 1 skipped.\n");

        let suite = {
            let mut suite = Suite::new([file_with(&[Status::Pass])]);
            suite.status = Status::Pass;
            suite
        };
        let view = HumanView::new(Vec::new());
        view.conclusion(&suite);
        assert_eq!(output(view), "\nSuccess! 1 passed, 0 failed.\n");
    }

    #[test]
    fn human_run_lines_include_diagnostics() {
        let mut file = file_with(&[Status::Fail]);
        file.runs[0]
            .diagnostics
            .push(Diagnostic::error("Test assertion failed", "name mismatch"));
        let view = HumanView::new(Vec::new());
        view.file(&file);
        view.run(&file.runs[0], &file);
        let text = output(view);
        assert!(text.starts_with("tests/main.test.toml... fail\n"));
        assert!(text.contains("  run \"run0\"... fail\n"));
        assert!(text.contains("    Error: Test assertion failed"));
        assert!(text.contains("name mismatch"));
    }

    #[test]
    fn json_view_writes_one_object_per_event() {
        let file = file_with(&[Status::Pass]);
        let view = JsonView::new(Vec::new());
        view.file(&file);
        view.run(&file.runs[0], &file);
        view.interrupted();
        let text = String::from_utf8(view.into_inner()).expect("utf8");
        let events: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["type"], "test_file");
        assert_eq!(events[0]["status"], "pass");
        assert_eq!(events[1]["run"], "run0");
        assert_eq!(events[2]["hard"], false);
    }

    #[test]
    fn saving_errored_state_writes_the_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("errored_test.main.run0.json");
        let file = file_with(&[Status::Error]);
        let view = HumanView::new(Vec::new());
        view.save_errored_state(&path, &file, &file.runs[0].run_ref(), &State::new())
            .expect("save");
        assert!(path.is_file());
        assert!(output(view).contains("Writing state to file"));
    }
}
