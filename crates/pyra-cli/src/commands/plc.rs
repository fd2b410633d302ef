// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! `pyra-cli plc` - direct operator control of the TUM enclosure.
//!
//! All commands refuse to run unless `tum_enclosure.controlled_by_user`
//! is set, so the operator and the supervisor's enclosure worker never
//! fight over the same PLC bits.

use clap::{Subcommand, ValueEnum};

use pyra_core::config::TumEnclosureConfig;
use pyra_core::context::CoreContext;
use pyra_core::plc::TumEnclosureDriver;

use crate::{CliError, CliResult};

#[derive(Clone, Copy, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(switch: Switch) -> bool {
        matches!(switch, Switch::On)
    }
}

#[derive(Subcommand)]
pub enum PlcCommand {
    /// Read a full enclosure snapshot and print it.
    Read,
    /// Pulse the PLC's reset flag.
    Reset,
    /// Move the cover to an angle in degrees (0 = closed).
    SetCoverAngle { angle: i64 },
    /// Force the cover closed and wait until it reports closed.
    CloseCover,
    /// Switch the camera power relay.
    SetCameraPower { value: Switch },
    /// Switch the EM27 computer power relay.
    SetComputerPower { value: Switch },
    /// Switch the heater power relay.
    SetHeaterPower { value: Switch },
    /// Switch the router power relay.
    SetRouterPower { value: Switch },
    /// Switch the spectrometer power relay.
    SetSpectrometerPower { value: Switch },
    /// Couple or decouple the cover from the sun tracker.
    SetSyncToTracker { value: Switch },
    /// Enable or disable automatic temperature control.
    SetAutoTemperature { value: Switch },
}

pub fn run(context: &CoreContext, command: PlcCommand) -> CliResult {
    let config = context.load_config()?;
    let enclosure = operator_enclosure_config(&config.tum_enclosure)?;
    let mut driver = TumEnclosureDriver::connect(&enclosure)?;

    match command {
        PlcCommand::Read => {
            let snapshot = driver.read()?;
            let text = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| CliError::User(e.to_string()))?;
            println!("{}", text);
        }
        PlcCommand::Reset => {
            driver.reset()?;
            println!("Reset pulsed");
        }
        PlcCommand::SetCoverAngle { angle } => {
            driver.move_cover(angle)?;
            driver.wait_for_cover_angle(angle)?;
            println!("Cover moved to {} degrees", angle);
        }
        PlcCommand::CloseCover => {
            driver.force_cover_close()?;
            println!("Cover closed");
        }
        PlcCommand::SetCameraPower { value } => {
            driver.set_power_camera(value.into())?;
            println!("Camera power updated");
        }
        PlcCommand::SetComputerPower { value } => {
            driver.set_power_computer(value.into())?;
            println!("Computer power updated");
        }
        PlcCommand::SetHeaterPower { value } => {
            driver.set_power_heater(value.into())?;
            println!("Heater power updated");
        }
        PlcCommand::SetRouterPower { value } => {
            driver.set_power_router(value.into())?;
            println!("Router power updated");
        }
        PlcCommand::SetSpectrometerPower { value } => {
            driver.set_power_spectrometer(value.into())?;
            println!("Spectrometer power updated");
        }
        PlcCommand::SetSyncToTracker { value } => {
            driver.set_sync_to_tracker(value.into())?;
            println!("Tracker sync updated");
        }
        PlcCommand::SetAutoTemperature { value } => {
            driver.set_auto_temperature(value.into())?;
            println!("Automatic temperature control updated");
        }
    }
    Ok(())
}

fn operator_enclosure_config(
    enclosure: &Option<TumEnclosureConfig>,
) -> Result<TumEnclosureConfig, CliError> {
    let Some(enclosure) = enclosure else {
        return Err(CliError::User(
            "this station has no TUM enclosure configured".to_string(),
        ));
    };
    if !enclosure.controlled_by_user {
        return Err(CliError::User(
            "enclosure is controlled by the supervisor; set \
             tum_enclosure.controlled_by_user to true first"
                .to_string(),
        ));
    }
    Ok(enclosure.clone())
}
