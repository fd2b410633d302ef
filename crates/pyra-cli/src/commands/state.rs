// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! `pyra-cli state` - inspect the runtime state document.

use clap::Subcommand;

use pyra_core::context::CoreContext;

use crate::{CliError, CliResult};

#[derive(Subcommand)]
pub enum StateCommand {
    /// Print the current state document.
    Get,
}

pub fn run(context: &CoreContext, command: StateCommand) -> CliResult {
    match command {
        StateCommand::Get => {
            let state = context
                .state_store
                .load()
                .map_err(|e| CliError::User(e.to_string()))?;
            let text = serde_json::to_string_pretty(&state)
                .map_err(|e| CliError::User(e.to_string()))?;
            println!("{}", text);
            Ok(())
        }
    }
}
