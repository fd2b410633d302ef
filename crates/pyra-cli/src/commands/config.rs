// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! `pyra-cli config` - read, patch and validate the configuration.

use clap::Subcommand;
use serde_json::Value;

use pyra_core::context::CoreContext;

use crate::{CliError, CliResult};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the current configuration document.
    Get,
    /// Merge a partial configuration document into the current one.
    Update {
        /// The partial document as a JSON object.
        patch: String,
    },
    /// Validate the on-disk configuration.
    Validate,
}

pub fn run(context: &CoreContext, command: ConfigCommand) -> CliResult {
    match command {
        ConfigCommand::Get => {
            // The CLI prints the document even when a referenced file is
            // missing on this machine.
            let config = context
                .config_store
                .load_with(true)
                .map_err(|e| CliError::User(e.to_string()))?;
            let text = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::User(e.to_string()))?;
            println!("{}", text);
            Ok(())
        }
        ConfigCommand::Update { patch } => {
            let patch: Value = serde_json::from_str(&patch)
                .map_err(|e| CliError::User(format!("Config update is invalid: {}", e)))?;
            context
                .config_store
                .update(&patch, true)
                .map_err(|e| CliError::User(format!("Config update is invalid: {}", e)))?;
            println!("Config update applied");
            Ok(())
        }
        ConfigCommand::Validate => {
            context
                .config_store
                .load()
                .map_err(|e| CliError::User(format!("Config file is invalid: {}", e)))?;
            println!("Current config file is valid");
            Ok(())
        }
    }
}
