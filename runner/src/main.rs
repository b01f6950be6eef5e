use anyhow::{bail, Context};
use bnb_runner::{
    collector::{collect_stubs, read_options_file},
    config::{ClusterConfig, Component, ConfigErrors},
    logging::init_logging,
    master::{self, control, RunMode},
    protocol::{TaskReport, TaskStatus},
    registry,
    shutdown::install_shutdown_handler,
    slave,
};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use std::{path::PathBuf, process::ExitCode};
use tracing::error;

/// Distributed branch-and-bound subproblem farm
#[derive(Parser, Debug)]
#[command(name = "bnb", version, about)]
struct Cli {
    /// YAML config file, defaults apply to everything left out
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Registry rendezvous address, overrides the config file and BNB_REGISTRY
    #[arg(long, global = true)]
    registry: Option<String>,

    /// More output per occurrence (debug, trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node registry
    Registry,
    /// Run a slave agent on this host
    Slave {
        /// Number of slots, defaults to the number of logical processors
        #[arg(long)]
        capacity: Option<u32>,
        /// Address to accept masters on
        #[arg(long)]
        listen: Option<String>,
        /// Address masters should use to reach this slave
        #[arg(long)]
        advertise: Option<String>,
    },
    /// Run a standing master that keeps accepting batches
    Master {
        /// Address of the control endpoint for `submit` and `status`
        #[arg(long)]
        control: Option<String>,
        #[command(flatten)]
        solve: SolveArgs,
    },
    /// Solve a batch of stubs and exit once every one is done
    Solve {
        #[command(flatten)]
        solve: SolveArgs,
    },
    /// Hand further stubs to a standing master
    Submit {
        #[arg(long)]
        control: String,
        #[arg(required = true)]
        stubs: Vec<PathBuf>,
    },
    /// Show the tasks of a standing master
    Status {
        #[arg(long)]
        control: String,
    },
}

#[derive(Args, Debug)]
struct SolveArgs {
    /// File with one solver option per line
    #[arg(long)]
    options_file: Option<PathBuf>,
    /// Solver option, may be repeated; applied after the options file
    #[arg(long = "option", allow_hyphen_values = true)]
    options: Vec<String>,
    /// Stub files or directories holding them
    stubs: Vec<PathBuf>,
}

impl SolveArgs {
    fn options(&self) -> Result<Vec<String>, ConfigErrors> {
        let mut options = match &self.options_file {
            Some(path) => read_options_file(path)?,
            None => Vec::new(),
        };
        options.extend(self.options.iter().cloned());

        Ok(options)
    }
}

fn preflight(config: &ClusterConfig, component: Component) -> Result<(), ConfigErrors> {
    if config.preflight_checks(component) {
        Err(ConfigErrors::Preflight)
    } else {
        Ok(())
    }
}

fn print_report(tasks: &[TaskReport]) {
    for task in tasks {
        let attempts = match task.attempts {
            0 => String::new(),
            n => format!(" after {n} failed attempt(s)"),
        };
        println!("{}: {}{attempts}", task.stub.display(), task.status);
    }

    let counts = tasks
        .iter()
        .counts_by(|task| match task.status {
            TaskStatus::Completed { .. } => "solved",
            TaskStatus::Failed { .. } => "failed",
            _ => "unfinished",
        });
    println!(
        "{}",
        counts
            .into_iter()
            .sorted()
            .map(|(state, count)| format!("{count} {state}"))
            .join(", ")
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ClusterConfig::load(cli.config.as_deref())?;
    if let Some(address) = cli.registry {
        config.registry.address = address;
    }
    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    match cli.command {
        Command::Registry => {
            preflight(&config, Component::Registry)?;
            registry::run(config.registry, shutdown).await?;
        }
        Command::Slave {
            capacity,
            listen,
            advertise,
        } => {
            config.slave.capacity = capacity.or(config.slave.capacity);
            config.slave.listen = listen.unwrap_or(config.slave.listen);
            config.slave.advertise = advertise.or(config.slave.advertise);
            preflight(&config, Component::Slave)?;

            slave::run(config, shutdown).await?;
        }
        Command::Master { control, solve } => {
            config.master.control = control.or(config.master.control);
            preflight(&config, Component::Master)?;
            let stubs = collect_stubs(&solve.stubs, &config.master.glob)?;
            let options = solve.options()?;

            let report = master::run(config, RunMode::Standing, stubs, options, shutdown).await?;
            print_report(&report);
        }
        Command::Solve { solve } => {
            preflight(&config, Component::Master)?;
            if solve.stubs.is_empty() {
                bail!("Nothing to solve, pass at least one stub or directory");
            }
            let stubs = collect_stubs(&solve.stubs, &config.master.glob)?;
            let options = solve.options()?;

            let report = master::run(config, RunMode::SolveOnce, stubs, options, shutdown).await?;
            print_report(&report);

            if !report
                .iter()
                .all(|task| matches!(task.status, TaskStatus::Completed { .. }))
            {
                error!("Not every subproblem was solved");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Submit { control, stubs } => {
            let stubs = collect_stubs(&stubs, &config.master.glob)?;
            let count = control::submit(&control, stubs, config.master.request_timeout()).await?;
            println!("{count} subproblem(s) queued");
        }
        Command::Status { control } => {
            let tasks = control::status(&control, config.master.request_timeout()).await?;
            print_report(&tasks);
        }
    }

    Ok(ExitCode::SUCCESS)
}
