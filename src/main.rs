use std::error::Error as _;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{CommandFactory, Parser, error::ErrorKind};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use steward::cli::{Cli, Commands, SnapshotArgs, StatusArgs};
use steward::core::feed::{handle_notifications, parse_notifications};
use steward::core::{Agent, LockMode, LockOutcome, SubprocessDispatcher};
use steward::{AgentConfig, Error, Result, load_agent_config};

const LOG_ENV: &str = "STEWARD_LOG";

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let Cli {
        config,
        verbose,
        command,
    } = cli;

    let Some(command) = command else {
        let mut command = Cli::command();
        let _ = command.print_help();
        println!();
        return ExitCode::from(64);
    };

    let agent_config = match load_agent_config(config.as_deref()) {
        Ok(agent_config) => agent_config,
        Err(err) => {
            init_logging(verbose, None);
            return report(&err);
        }
    };
    init_logging(verbose, agent_config.log_file.as_deref());
    for warning in &agent_config.warnings {
        tracing::warn!("{warning}");
    }

    match run(command, agent_config, config) {
        Ok(code) => code,
        Err(err) => report(&err),
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            Err(err) => {
                eprintln!("Warning: cannot open log file {}: {err}", path.display());
                None
            }
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
}

fn report(err: &Error) -> ExitCode {
    if err.is_expected() {
        tracing::warn!("{err}");
    } else {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(&format!("\n  caused by: {cause}"));
            source = cause.source();
        }
        tracing::error!("{message}");
    }
    err.exit_code()
}

fn run(command: Commands, config: AgentConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    match command {
        Commands::Status(args) => handle_status(args, config),
        Commands::Ensure(args) => {
            let output = Agent::open(config, &args.vm).ensure(LockMode::NonBlocking)?;
            let outcome = output.value;
            println!(
                "{}: {} -> {} (generation {}, {} pass{})",
                args.vm,
                outcome.from,
                outcome.to,
                outcome.generation,
                outcome.passes,
                if outcome.passes == 1 { "" } else { "es" }
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Start(args) => {
            Agent::open(config, &args.vm).start()?;
            println!("{}: started", args.vm);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop(args) => {
            let output = Agent::open(config, &args.vm).stop()?;
            println!(
                "{}: {}",
                args.vm,
                if output.value.stopped { "stopped" } else { "was not running" }
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restart(args) => {
            Agent::open(config, &args.vm).restart()?;
            println!("{}: restarted", args.vm);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Lock(args) => {
            let output = Agent::open(config, &args.vm).lock()?;
            print_locks(&args.vm, &output.value);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Unlock(args) => {
            let output = Agent::open(config, &args.vm).unlock()?;
            print_locks(&args.vm, &output.value);
            Ok(ExitCode::SUCCESS)
        }
        Commands::ForceUnlock(args) => {
            let output = Agent::open(config, &args.vm).force_unlock()?;
            print_locks(&args.vm, &output.value);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Snapshot(args) => handle_snapshot(args, config),
        Commands::Inmigrate(args) => {
            let outcome = Agent::open(config, &args.vm).inmigrate()?.value;
            println!(
                "{}: incoming migration {} after {} call(s)",
                args.vm, outcome.status, outcome.calls
            );
            Ok(exit_for(outcome.succeeded()))
        }
        Commands::Outmigrate(args) => {
            let outcome = Agent::open(config, &args.vm).outmigrate()?.value;
            println!("{}: {outcome}", args.vm);
            Ok(exit_for(outcome.succeeded()))
        }
        Commands::HandleEvent => handle_event(config, config_path),
    }
}

fn exit_for(succeeded: bool) -> ExitCode {
    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn handle_status(args: StatusArgs, config: AgentConfig) -> Result<ExitCode> {
    let report = Agent::open(config, &args.vm).status()?;
    if args.check {
        // Registry health checks read anything but 0 and 1 as critical.
        return Ok(if report.healthy() {
            ExitCode::SUCCESS
        } else {
            println!("{}: {}", report.vm, report.state);
            ExitCode::from(2)
        });
    }
    println!("{report}");
    Ok(ExitCode::SUCCESS)
}

fn handle_snapshot(args: SnapshotArgs, config: AgentConfig) -> Result<ExitCode> {
    let outcome = Agent::open(config, &args.vm).snapshot(&args.name)?.value;
    let verb = if outcome.created { "created" } else { "already exists" };
    let frozen = if outcome.frozen { " (filesystem frozen)" } else { "" };
    println!("{}: snapshot `{}` {verb}{frozen}", args.vm, outcome.name);
    Ok(ExitCode::SUCCESS)
}

fn handle_event(config: AgentConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|err| Error::Io {
            context: "Failed to read notifications from stdin".to_string(),
            source: err,
        })?;
    let notifications = parse_notifications(&input)?;

    let program = std::env::current_exe().map_err(|err| Error::Io {
        context: "Failed to locate the steward executable".to_string(),
        source: err,
    })?;
    let dispatcher = SubprocessDispatcher::new(program, config_path);
    let outcome = handle_notifications(&config, &notifications, &dispatcher)?.value;

    for (vm, generation) in &outcome.staged {
        println!("{vm}: staged generation {generation}");
    }
    for vm in &outcome.unchanged {
        println!("{vm}: config is unchanged");
    }
    for (subject, reason) in &outcome.failures {
        eprintln!("{subject}: {reason}");
    }
    Ok(exit_for(outcome.succeeded()))
}

fn print_locks(vm: &str, outcome: &LockOutcome) {
    for (volume, change) in &outcome.changes {
        println!("{vm}: {volume} {change}");
    }
}
