use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{error::ErrorKind, ArgAction, Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use ls8::{loader, metrics, server, HaltReason, Machine, MachineSnapshot};

/// Run an LS-8 program, or host machines over HTTP.
#[derive(Debug, Parser)]
#[command(name = "ls8", version, about, args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    /// Program file: one 8-bit binary literal per line, `#` starts a comment
    #[arg(required = true)]
    program: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print a trace line to stderr before every instruction
    #[arg(long)]
    trace: bool,

    /// Stop after this many instructions (0 runs until halt)
    #[arg(long, default_value_t = 0)]
    max_steps: u64,

    /// Print the final machine state as JSON after the run
    #[arg(long)]
    dump_state: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP control plane
    Serve {
        #[arg(long, default_value = "127.0.0.1:3030")]
        addr: SocketAddr,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let stderr_format = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(level)
        .with(stderr_format)
        .init();
}

fn run_program(cli: &Cli, path: &Path) -> anyhow::Result<ExitCode> {
    let program = loader::load_file(path)?;

    metrics::init_metrics().context("registering metrics")?;
    let mut machine = Machine::new();
    machine
        .load(&program)
        .with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = program.len(), "starting program");

    let trace = cli.trace;
    let result = machine.run_with(cli.max_steps, |m| {
        if trace {
            eprintln!("{}", m.trace());
        }
    });

    let code = match result {
        Ok(HaltReason::DivisionByZero) => {
            eprintln!("Division by zero at pc {}", machine.cpu.get_pc());
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    };

    if cli.dump_state {
        let snapshot = MachineSnapshot::capture(&machine);
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(code)
}

fn serve(addr: SocketAddr) -> anyhow::Result<ExitCode> {
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime
        .block_on(server::run_server(addr))
        .context("running server")?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    init_logging(cli.verbose);

    let result = match (&cli.command, &cli.program) {
        (Some(Command::Serve { addr }), _) => serve(*addr),
        (None, Some(path)) => run_program(&cli, path),
        (None, None) => Err(anyhow::anyhow!("no program given")),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
