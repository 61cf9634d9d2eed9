pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "tradeback",
    about = "Tradeback operator CLI",
    long_about = "Operate the tradeback store: migrations, readiness checks, config inspection, worker identities and exchange audit exports.",
    after_help = "Examples:\n  tradeback doctor --json\n  tradeback workers add worker-1 --daily-cap 40 --action view\n  tradeback export EX-0123"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, driver readiness, DB connectivity and the worker pool")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Register or list automation worker identities")]
    Workers {
        #[command(subcommand)]
        command: WorkersCommand,
    },
    #[command(about = "Summarize persisted exchanges by state and workers by status")]
    Status,
    #[command(about = "Print an exchange with its turns and tasks, stamped with a SHA-256 digest")]
    Export {
        #[arg(help = "Exchange id, e.g. EX-…")]
        exchange_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum WorkersCommand {
    #[command(about = "Register a new worker identity")]
    Add {
        worker_id: String,
        #[arg(long, help = "Daily action cap (defaults to workers.default_daily_cap)")]
        daily_cap: Option<u32>,
        #[arg(long = "action", help = "Supported action type; repeat for several, omit for all")]
        actions: Vec<String>,
    },
    #[command(about = "List registered worker identities")]
    List,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Workers { command: WorkersCommand::Add { worker_id, daily_cap, actions } } => {
            commands::workers::add(&worker_id, daily_cap, &actions)
        }
        Command::Workers { command: WorkersCommand::List } => commands::workers::list(),
        Command::Status => commands::status::run(),
        Command::Export { exchange_id } => commands::export::run(&exchange_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
