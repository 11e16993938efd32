//! Runs every test file of a suite and owns the interrupt lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::core::module::SuiteConfig;
use crate::core::suite::Suite;
use crate::core::types::Status;
use crate::exit_codes;
use crate::file_runner::FileRunner;
use crate::interrupt::{Escalation, Interrupts, wait_with_grace};
use crate::io::engine::Engine;
use crate::io::variables::GlobalVariables;
use crate::view::View;

/// Everything shared by the file runners of one invocation.
pub struct SuiteContext<E: Engine, V: View> {
    pub engine: Arc<E>,
    pub view: Arc<V>,
    pub globals: GlobalVariables,
    pub interrupts: Interrupts,
    /// Record plans and states on runs for rendering.
    pub verbose: bool,
    /// Where errored-state artifacts are written.
    pub errored_state_dir: PathBuf,
}

impl<E: Engine, V: View> SuiteContext<E, V> {
    pub fn new(engine: Arc<E>, view: Arc<V>) -> Self {
        Self {
            engine,
            view,
            globals: GlobalVariables::new(),
            interrupts: Interrupts::new(),
            verbose: false,
            errored_state_dir: PathBuf::from("."),
        }
    }
}

pub struct SuiteRunner<E: Engine, V: View> {
    ctx: SuiteContext<E, V>,
    config: SuiteConfig,
}

impl<E: Engine, V: View + 'static> SuiteRunner<E, V> {
    pub fn new(ctx: SuiteContext<E, V>, config: SuiteConfig) -> Self {
        Self { ctx, config }
    }

    /// Execute files in name order, cleaning up after each one.
    ///
    /// Stops iterating as soon as a hard cancel is observed; files not reached
    /// keep their pending status.
    #[instrument(skip_all, fields(files = suite.files.len()))]
    pub async fn start(mut self, mut suite: Suite) -> Suite {
        suite.status = suite.status.merge(Status::Pass);
        for file in suite.files.values_mut() {
            if self.ctx.interrupts.is_cancelled() {
                debug!("suite cancelled; abandoning remaining files");
                break;
            }
            let mut runner = FileRunner::new(&self.ctx);
            runner.execute_file(file, &mut self.config).await;
            file.cleanup = runner.cleanup(file, &mut self.config).await;
            suite.status = suite.status.merge(file.status);
        }
        info!(status = %suite.status, "suite finished");
        suite
    }
}

/// How an invocation ended.
#[derive(Debug)]
pub enum SuiteOutcome {
    Completed(Suite),
    /// Hard-cancelled; no conclusion was reported.
    Cancelled,
}

impl SuiteOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SuiteOutcome::Completed(suite) if suite.status == Status::Pass => exit_codes::OK,
            _ => exit_codes::FAILED,
        }
    }
}

/// Run `suite` to completion while translating `signals` into interrupts.
///
/// The first signal requests a stop, the second a cancel. After a cancel the
/// suite gets `grace` to wind down before control returns regardless.
pub async fn run_suite<E: Engine, V: View + 'static>(
    runner: SuiteRunner<E, V>,
    suite: Suite,
    mut signals: mpsc::Receiver<()>,
    grace: Duration,
) -> Result<SuiteOutcome> {
    let view = Arc::clone(&runner.ctx.view);
    let interrupts = runner.ctx.interrupts.clone();
    view.abstract_summary(&suite);

    let mut handle = tokio::spawn(runner.start(suite));
    let mut listening = true;
    loop {
        tokio::select! {
            joined = &mut handle => {
                let suite = joined.context("test suite task failed")?;
                if interrupts.is_cancelled() {
                    return Ok(SuiteOutcome::Cancelled);
                }
                view.conclusion(&suite);
                return Ok(SuiteOutcome::Completed(suite));
            }
            signal = signals.recv(), if listening => {
                let Some(()) = signal else {
                    listening = false;
                    continue;
                };
                match interrupts.escalate() {
                    Escalation::Stopped => view.interrupted(),
                    Escalation::Cancelled => {
                        view.fatal_interrupt();
                        match wait_with_grace(&mut handle, grace).await {
                            Some(Ok(_)) => debug!("suite wound down after cancel"),
                            Some(Err(err)) => warn!(error = %err, "suite task failed after cancel"),
                            None => warn!(?grace, "grace period expired; abandoning suite"),
                        }
                        return Ok(SuiteOutcome::Cancelled);
                    }
                    Escalation::AlreadyCancelled => {}
                }
            }
        }
    }
}
