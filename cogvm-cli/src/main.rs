//! # cogvm CLI
//!
//! Command-line interface for running VM programs.
//!
//! Usage:
//!   cogvm run <program.json> [--responses replies.json] [--library lib.json]...
//!   cogvm check <program.json>
//!
//! Examples:
//!   cogvm run demos/triage.json --responses demos/triage-replies.json --trace
//!   cogvm -v run build.json --root . --goal "fix the failing test"
//!   cogvm check demos/triage.json

use clap::{Parser, Subcommand};
use cogvm_vm::{
    LocalToolUnit, Program, Register, Result, Scheduler, ScriptedComputeUnit, Storage, VmConfig,
};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "cogvm")]
#[command(author, version, about = "cogvm - a VM around a slow, fallible compute unit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program and print its outcome as JSON
    Run {
        /// Path to the program JSON file
        file: PathBuf,

        /// Programs reachable by CALL and SPAWN
        #[arg(short, long)]
        library: Vec<PathBuf>,

        /// Scripted compute replies: {responses, queue, fallback}
        #[arg(short, long)]
        responses: Option<PathBuf>,

        /// VM configuration JSON
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for the durable page store (in memory when absent)
        #[arg(long)]
        storage: Option<PathBuf>,

        /// Confine tool paths and commands to this directory
        #[arg(long)]
        root: Option<PathBuf>,

        /// Initial value of the goal register
        #[arg(short, long)]
        goal: Option<String>,

        /// Override the per-task step limit
        #[arg(long)]
        max_steps: Option<usize>,

        /// Print the execution trace to stderr
        #[arg(long)]
        trace: bool,
    },
    /// Validate a program and print its listing
    Check {
        /// Path to the program JSON file
        file: PathBuf,
    },
}

struct RunArgs {
    file: PathBuf,
    library: Vec<PathBuf>,
    responses: Option<PathBuf>,
    config: Option<PathBuf>,
    storage: Option<PathBuf>,
    root: Option<PathBuf>,
    goal: Option<String>,
    max_steps: Option<usize>,
    trace: bool,
}

fn load_program(path: &PathBuf) -> Result<Program> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| cogvm_vm::Error::from(e).with_context("path", path.display().to_string()))?;
    Program::from_json(&text).map_err(|e| e.with_context("path", path.display().to_string()))
}

async fn run(args: RunArgs) -> Result<bool> {
    let mut config = match &args.config {
        Some(path) => VmConfig::from_file(path)?,
        None => VmConfig::default(),
    };
    if let Some(max_steps) = args.max_steps {
        config = config.with_max_steps(max_steps);
    }
    config.validate()?;

    // Without a script every compute call lands as an InvalidResponse payload
    let compute = match &args.responses {
        Some(path) => ScriptedComputeUnit::from_file(path)?,
        None => ScriptedComputeUnit::new(),
    };
    let tools = match &args.root {
        Some(root) => LocalToolUnit::with_root(root),
        None => LocalToolUnit::new(),
    };
    let storage = match &args.storage {
        Some(dir) => Storage::file(dir)?,
        None => Storage::memory(),
    };

    let mut vm = Scheduler::new(config, compute, tools).with_storage(storage);
    if let Some(goal) = args.goal {
        vm.set_register(Register::Goal, Value::String(goal));
    }
    for path in &args.library {
        let program = load_program(path)?;
        debug!(program = %program.id, "registered library program");
        vm.register(&program)?;
    }

    let program = load_program(&args.file)?;
    vm.submit(&program)?;
    let outcome = vm.run().await?;

    if args.trace {
        eprintln!("--- Execution Trace ({} entries) ---", vm.trace().len());
        eprintln!("{}", vm.trace().render());
    }
    let rendered = serde_json::to_string_pretty(&outcome.to_value())
        .map_err(|e| cogvm_vm::error::serialization_error(e.to_string()))?;
    println!("{}", rendered);
    Ok(outcome.success)
}

fn check(file: &PathBuf) -> Result<()> {
    let program = load_program(file)?;
    program.pretty_print();
    println!("ok: {} ({} opcodes)", program.id, program.code.len());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            file,
            library,
            responses,
            config,
            storage,
            root,
            goal,
            max_steps,
            trace,
        } => {
            let args = RunArgs {
                file,
                library,
                responses,
                config,
                storage,
                root,
                goal,
                max_steps,
                trace,
            };
            run(args).await
        }
        Commands::Check { file } => check(&file).map(|()| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
