pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "brokerdesk",
    about = "Brokerdesk operator CLI",
    long_about = "Operate Brokerdesk migrations, demo fixtures, config inspection, and smoke validation.",
    after_help = "Examples:\n  brokerdesk doctor --json\n  brokerdesk config\n  brokerdesk smoke"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load deterministic demo fixtures and verify the seeded dataset")]
    Seed,
    #[command(about = "Run end-to-end readiness checks, including an in-memory assistant turn")]
    Smoke,
    #[command(about = "Inspect effective configuration values with secret redaction")]
    Config,
    #[command(about = "Validate config, LLM gateway readiness, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Smoke => commands::smoke::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
