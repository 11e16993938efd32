//! Declarative infrastructure module test runner.
//!
//! Discovers `*.test.toml` files next to a `module.toml`, runs their run
//! blocks against the simulated engine, cleans up what they created and
//! reports the results.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use tokio::sync::mpsc;

use infratest::core::suite::Suite;
use infratest::core::testfile::RunCommand;
use infratest::exit_codes;
use infratest::interrupt::Interrupts;
use infratest::io::config::{CONFIG_FILE, RunnerConfig, load_config};
use infratest::io::loader::{LoadedSuite, load_suite};
use infratest::io::simulated::SimulatedEngine;
use infratest::io::variables::{VarArg, VariableSources, collect_global_variables};
use infratest::logging;
use infratest::suite_runner::{SuiteContext, SuiteRunner, run_suite};
use infratest::view::{HumanView, JsonView, View};

/// How long the runtime waits for abandoned engine calls on exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "infratest",
    version,
    about = "Run declarative tests against infrastructure modules"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute test files, clean up what they created and report results.
    Test(TestArgs),
    /// List discovered test files and their run blocks without executing them.
    List(SelectionArgs),
}

#[derive(Args)]
struct SelectionArgs {
    /// Only use this test file (relative to the working directory). Repeatable.
    #[arg(long = "filter", value_name = "FILE")]
    filter: Vec<String>,
    /// Directory holding test files, relative to the working directory.
    #[arg(long, value_name = "DIR")]
    test_directory: Option<PathBuf>,
    /// Switch to this directory before doing anything else.
    #[arg(long, value_name = "DIR")]
    chdir: Option<PathBuf>,
}

#[derive(Args)]
struct TestArgs {
    #[command(flatten)]
    selection: SelectionArgs,
    /// Set a global variable value. Repeatable; later values win.
    #[arg(long = "var", value_name = "NAME=VALUE")]
    var: Vec<String>,
    /// Load global variable values from a TOML or JSON file. Repeatable.
    #[arg(long = "var-file", value_name = "PATH")]
    var_file: Vec<PathBuf>,
    /// Emit one JSON object per event instead of text.
    #[arg(long)]
    json: bool,
    /// Print the plan and state of every run.
    #[arg(long)]
    verbose: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    logging::init();
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    match cli.command {
        Command::Test(args) => {
            let sub = matches
                .subcommand_matches("test")
                .context("missing test arguments")?;
            let var_args = ordered_var_args(sub);
            run_test(args, var_args)
        }
        Command::List(selection) => run_list(&selection),
    }
}

/// `--var` and `--var-file` interleaved in command-line order.
fn ordered_var_args(matches: &ArgMatches) -> Vec<VarArg> {
    let mut args: Vec<(usize, VarArg)> = Vec::new();
    if let (Some(indices), Some(values)) =
        (matches.indices_of("var"), matches.get_many::<String>("var"))
    {
        args.extend(indices.zip(values.map(|raw| VarArg::Literal(raw.clone()))));
    }
    if let (Some(indices), Some(values)) = (
        matches.indices_of("var_file"),
        matches.get_many::<PathBuf>("var_file"),
    ) {
        args.extend(indices.zip(values.map(|path| VarArg::File(path.clone()))));
    }
    args.sort_by_key(|(index, _)| *index);
    args.into_iter().map(|(_, arg)| arg).collect()
}

fn workspace(selection: &SelectionArgs) -> Result<(PathBuf, RunnerConfig)> {
    let cwd = env::current_dir().context("resolve current directory")?;
    let dir = match &selection.chdir {
        Some(chdir) => cwd.join(chdir),
        None => cwd,
    };
    let mut config = load_config(&dir.join(CONFIG_FILE))?;
    if let Some(test_directory) = &selection.test_directory {
        config.test_directory = test_directory.clone();
    }
    config.validate().context("invalid test directory")?;
    Ok((dir, config))
}

fn run_test(args: TestArgs, var_args: Vec<VarArg>) -> Result<i32> {
    let (dir, mut config) = workspace(&args.selection)?;
    config.verbose |= args.verbose;
    let loaded = load_suite(&dir, &config.test_directory, &args.selection.filter)?;
    if args.json {
        execute(JsonView::new(io::stdout()), &dir, &config, loaded, var_args)
    } else {
        execute(HumanView::new(io::stdout()), &dir, &config, loaded, var_args)
    }
}

fn execute<V: View + 'static>(
    view: V,
    dir: &Path,
    config: &RunnerConfig,
    loaded: LoadedSuite,
    var_args: Vec<VarArg>,
) -> Result<i32> {
    let view = Arc::new(view);
    let sources = VariableSources {
        working_dir: dir.to_path_buf(),
        test_dir: config.test_directory.clone(),
        env_prefix: config.var_env_prefix.clone(),
        args: var_args,
    };
    let (globals, var_diags) = collect_global_variables(&sources, env::vars());

    let mut setup = loaded.diagnostics;
    let var_failed = var_diags.has_errors();
    setup.extend(var_diags);
    if !setup.is_empty() {
        view.diagnostics(None, None, &setup);
    }
    if var_failed {
        return Ok(exit_codes::FAILED);
    }

    let ctx = SuiteContext {
        engine: Arc::new(SimulatedEngine::new()),
        view,
        globals,
        interrupts: Interrupts::new(),
        verbose: config.verbose,
        errored_state_dir: dir.join(&config.errored_state_dir),
    };
    let suite = Suite::new(loaded.files);
    let runner = SuiteRunner::new(ctx, loaded.config);
    let grace = config.cancel_grace();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let outcome = runtime.block_on(async move {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(forward_interrupts(tx));
        run_suite(runner, suite, rx, grace).await
    });
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    Ok(outcome?.exit_code())
}

async fn forward_interrupts(tx: mpsc::Sender<()>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if tx.send(()).await.is_err() {
            break;
        }
    }
}

fn run_list(selection: &SelectionArgs) -> Result<i32> {
    let (dir, config) = workspace(selection)?;
    let loaded = load_suite(&dir, &config.test_directory, &selection.filter)?;
    for diag in &loaded.diagnostics {
        eprintln!("{diag}\n");
    }
    let mut runs = 0;
    for file in &loaded.files {
        println!("{}", file.name);
        for run in &file.runs {
            let command = match run.config.command {
                RunCommand::Apply => "apply",
                RunCommand::Plan => "plan",
            };
            println!("  run {:?} ({command})", run.name);
            runs += 1;
        }
    }
    println!("{} file(s), {runs} run block(s)", loaded.files.len());
    Ok(exit_codes::OK)
}
