// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Operator command-line tool for Pyra Core.
//!
//! Talks to the same file-locked config and state stores as the running
//! supervisor, so everything here is safe to use while the station
//! measures. Exit codes: 0 success, 1 user/config error, 2
//! integration/network error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use pyra_core::context::CoreContext;
use pyra_core::error::PyraError;

mod commands;

/// A command failure with its exit code.
#[derive(Debug)]
pub enum CliError {
    /// Bad input or an invalid configuration (exit 1).
    User(String),
    /// A hardware, network or remote-program failure (exit 2).
    Integration(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::User(_) => ExitCode::from(1),
            CliError::Integration(_) => ExitCode::from(2),
        }
    }

    fn message(&self) -> &str {
        match self {
            CliError::User(message) | CliError::Integration(message) => message,
        }
    }
}

impl From<PyraError> for CliError {
    fn from(error: PyraError) -> Self {
        match error {
            PyraError::Config { .. } => CliError::User(error.to_string()),
            _ => CliError::Integration(error.to_string()),
        }
    }
}

pub type CliResult = Result<(), CliError>;

#[derive(Parser)]
#[command(name = "pyra-cli", version = pyra_core::VERSION, about = "Operate a Pyra EM27 field station")]
struct Cli {
    /// Project root holding config/, runtime-data/ and logs/.
    #[arg(long, env = "PYRA_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read and write the configuration document.
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),
    /// Read the runtime state document.
    #[command(subcommand)]
    State(commands::state::StateCommand),
    /// Start, stop and query the supervisor process.
    #[command(subcommand)]
    Core(commands::core::CoreCommand),
    /// Drive the TUM enclosure directly (requires controlled_by_user).
    #[command(subcommand)]
    Plc(commands::plc::PlcCommand),
    /// Health probes for the station's external collaborators.
    #[command(subcommand)]
    Test(commands::probes::TestCommand),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let context = CoreContext::new(&cli.root);
    record_cli_call(&context);

    let outcome = match cli.command {
        Command::Config(command) => commands::config::run(&context, command),
        Command::State(command) => commands::state::run(&context, command),
        Command::Core(command) => commands::core::run(&cli.root, command),
        Command::Plc(command) => commands::plc::run(&context, command),
        Command::Test(command) => commands::probes::run(&context, command),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", error.message());
            error.exit_code()
        }
    }
}

/// Count this invocation in the activity metrics. Best effort: a station
/// without an initialized state store still gets a working CLI.
fn record_cli_call(context: &CoreContext) {
    let _ = context.state_store.update_state(|state| {
        state.activity.cli_calls += 1;
        state.recent_cli_calls += 1;
        Ok(())
    });
}
