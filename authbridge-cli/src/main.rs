//! AuthBridge CLI - replay and inspect embedded identity provider sign-in flows.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;

use exit_codes::ExitCode;

const AFTER_HELP: &str = "Exit codes:
  0   Success
  1   General error
  64  Usage error
  65  Data error (malformed input, flow did not complete)
  66  Scenario file not found";

#[derive(Parser)]
#[command(name = "authbridge")]
#[command(author, version, about = "Embedded identity provider sign-in protocol tools", long_about = None)]
#[command(after_help = AFTER_HELP)]
struct Cli {
    /// Print only machine output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON scenario of environment events and report the outcome
    Replay {
        /// Path to the scenario file
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,

        /// Print the completion payload as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a sign-in response header value
    InspectSignin {
        /// Raw header value, e.g. 'email="a@b.c", obfuscatedid="1", sessionindex=0'
        #[arg(value_name = "HEADER")]
        header: String,

        /// Print the parsed fields as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "authbridge_core=debug,authbridge=debug"
    } else if cli.quiet {
        "error"
    } else {
        "authbridge_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(cli.color != ColorChoice::Never)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.color {
        ColorChoice::Always => colored::control::set_override(true),
        ColorChoice::Never => colored::control::set_override(false),
        ColorChoice::Auto => {}
    }
    init_tracing(&cli);

    let result: Result<()> = match cli.command {
        Commands::Replay { scenario, json } => {
            commands::replay::execute(scenario, json, cli.quiet).await
        }
        Commands::InspectSignin { header, json } => {
            commands::inspect::execute(&header, json, cli.quiet)
        }
    };

    if let Err(err) = result {
        let exit = ExitCode::from_anyhow(&err);
        if let Some(message) = exit.message {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
        std::process::exit(exit.code);
    }
}
