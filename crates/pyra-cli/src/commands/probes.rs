// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! `pyra-cli test` - health probes for the external collaborators.
//!
//! Each probe exercises one integration end to end and reports a short
//! reason on failure. Probes never mutate station state beyond what the
//! probe itself requires (the email probe really sends a mail).

use clap::Subcommand;

use pyra_core::camtracker::CamTrackerDriver;
use pyra_core::context::CoreContext;
use pyra_core::email::EmailClient;
use pyra_core::opus::{OpusDriver, TcpOpusChannel};
use pyra_core::upload::RemoteClient;

use crate::{CliError, CliResult};

#[derive(Subcommand)]
pub enum TestCommand {
    /// Probe the OPUS command pipe and ping the EM27.
    Opus,
    /// Probe the CamTracker installation and its motor offset log.
    Camtracker,
    /// Send a test email over the configured SMTP channel.
    Email,
    /// Probe the SFTP endpoint and the configured stream directories.
    Upload,
}

pub fn run(context: &CoreContext, command: TestCommand) -> CliResult {
    let config = context.load_config()?;
    match command {
        TestCommand::Opus => {
            let mut driver = OpusDriver::new(Box::new(TcpOpusChannel::open));
            let busy = driver.some_macro_is_running()?;
            println!(
                "OPUS command pipe works ({})",
                if busy { "a macro is running" } else { "idle" }
            );
            if !driver.ping_em27(&config.opus) {
                return Err(CliError::Integration(format!(
                    "EM27 at {} does not answer pings",
                    config.opus.em27_ip
                )));
            }
            println!("EM27 at {} answers pings", config.opus.em27_ip);
            Ok(())
        }
        TestCommand::Camtracker => {
            for (label, path) in [
                ("executable", &config.camtracker.executable_path),
                ("config file", &config.camtracker.config_path),
            ] {
                if !path.exists() {
                    return Err(CliError::User(format!(
                        "CamTracker {} missing at {}",
                        label,
                        path.display()
                    )));
                }
            }
            println!("CamTracker installation found");
            if config.camtracker.learn_az_elev_path.exists() {
                let line = CamTrackerDriver::read_learn_log(&config.camtracker)?;
                println!(
                    "Motor offsets: elevation {:.4} deg, azimuth {:.4} deg",
                    line.elevation_offset, line.azimuth_offset
                );
            } else {
                println!("No motor offset log yet (CamTracker has not run)");
            }
            Ok(())
        }
        TestCommand::Email => {
            let client = EmailClient::new(config.error_email.clone());
            client.send_test(&config.general.station_id)?;
            println!("Test email sent to {}", config.error_email.recipients);
            Ok(())
        }
        TestCommand::Upload => {
            let Some(upload) = &config.upload else {
                return Err(CliError::User(
                    "this station has no upload configured".to_string(),
                ));
            };
            let client = RemoteClient::connect(upload)?;
            println!("SFTP endpoint {} reachable", upload.host);
            for stream in upload.streams.iter().filter(|stream| stream.is_active) {
                if !stream.src_directory.is_dir() {
                    return Err(CliError::User(format!(
                        "stream source directory missing: {}",
                        stream.src_directory.display()
                    )));
                }
                let remote = std::path::Path::new(&stream.dst_directory);
                if !client.exists(remote) {
                    return Err(CliError::Integration(format!(
                        "remote directory missing: {}",
                        stream.dst_directory
                    )));
                }
            }
            println!("All active streams are wired up");
            Ok(())
        }
    }
}
