// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Driver for the TUM enclosure PLC.
//!
//! Bulk reads assemble a full [`TumEnclosureState`] snapshot; control
//! writes are verified by reading the echoed value back. The one safety
//! rule lives here: the cover never moves while rain is asserted.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info};

use crate::config::TumEnclosureConfig;
use crate::error::{PyraError, Result};
use crate::state::{
    TumActors, TumConnections, TumControl, TumEnclosureState, TumPower, TumSensors, TumStateFlags,
};

use super::addresses::{BulkReadResult, PlcAddress, PlcAddressTable};
use super::s7::S7Client;

/// Upper bound for the busy poll between requests; the CPU rejects
/// back-to-back requests while its cycle is busy.
const SETTLE: Duration = Duration::from_millis(200);

const SETTLE_POLL: Duration = Duration::from_millis(25);

/// Deadline for `actors.current_angle` to reach a requested angle.
pub const COVER_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for the cover to report closed after a close request.
pub const COVER_CLOSE_TIMEOUT: Duration = Duration::from_secs(90);

const VERIFY_ATTEMPTS: usize = 3;

/// The raw session operations the driver needs. [`S7Client`] is the
/// production implementation; tests substitute an in-memory PLC.
pub trait PlcInterface: Send {
    fn read_db(&mut self, db_number: u16, start: u16, size: u16) -> Result<Vec<u8>>;
    fn write_db(&mut self, db_number: u16, start: u16, data: &[u8]) -> Result<()>;
    fn write_bit(&mut self, db_number: u16, byte_offset: u16, bit_index: u8, value: bool)
        -> Result<()>;
    /// Whether the CPU cycle currently rejects requests.
    fn cpu_is_busy(&mut self) -> Result<bool>;
}

impl PlcInterface for S7Client {
    fn read_db(&mut self, db_number: u16, start: u16, size: u16) -> Result<Vec<u8>> {
        S7Client::read_db(self, db_number, start, size)
    }

    fn write_db(&mut self, db_number: u16, start: u16, data: &[u8]) -> Result<()> {
        S7Client::write_db(self, db_number, start, data)
    }

    fn write_bit(
        &mut self,
        db_number: u16,
        byte_offset: u16,
        bit_index: u8,
        value: bool,
    ) -> Result<()> {
        S7Client::write_bit(self, db_number, byte_offset, bit_index, value)
    }

    fn cpu_is_busy(&mut self) -> Result<bool> {
        S7Client::cpu_is_busy(self)
    }
}

/// A connected TUM enclosure.
pub struct TumEnclosureDriver<P: PlcInterface> {
    plc: P,
    config: TumEnclosureConfig,
    table: PlcAddressTable,
    last_snapshot: Option<TumEnclosureState>,
}

impl TumEnclosureDriver<S7Client> {
    /// Open a session to the configured PLC.
    pub fn connect(config: &TumEnclosureConfig) -> Result<Self> {
        let client = S7Client::connect(&config.ip)?;
        info!(ip = %config.ip, version = config.version, "Connected to enclosure PLC");
        Ok(Self::with_session(client, config.clone()))
    }

    /// Reconnect when the endpoint or protocol version changed.
    pub fn update_config(&mut self, new_config: &TumEnclosureConfig) -> Result<()> {
        if new_config.ip == self.config.ip && new_config.version == self.config.version {
            self.config = new_config.clone();
            return Ok(());
        }
        info!(ip = %new_config.ip, "Enclosure endpoint changed, reconnecting");
        self.plc = S7Client::connect(&new_config.ip)?;
        self.table = PlcAddressTable::for_version(new_config.version);
        self.config = new_config.clone();
        self.last_snapshot = None;
        Ok(())
    }
}

impl<P: PlcInterface> TumEnclosureDriver<P> {
    pub fn with_session(plc: P, config: TumEnclosureConfig) -> Self {
        let table = PlcAddressTable::for_version(config.version);
        Self {
            plc,
            config,
            table,
            last_snapshot: None,
        }
    }

    /// Wait out the CPU cycle before the next request, giving up after
    /// [`SETTLE`].
    fn settle(&mut self) -> Result<()> {
        let deadline = Instant::now() + SETTLE;
        while self.plc.cpu_is_busy()? {
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(SETTLE_POLL);
        }
        Ok(())
    }

    /// Perform the fixed bulk reads and decode a full snapshot.
    pub fn read(&mut self) -> Result<TumEnclosureState> {
        let mut result = BulkReadResult::default();
        let mut first = true;
        for (db_number, size) in self.table.bulk_reads.clone() {
            if !first {
                self.settle()?;
            }
            first = false;
            let bytes = self.plc.read_db(db_number, 0, size)?;
            result.insert(db_number, bytes);
        }

        let table = &self.table;
        let snapshot = TumEnclosureState {
            last_full_fetch: Some(Utc::now()),
            actors: TumActors {
                fan_speed: result.get_word(&table.fan_speed),
                current_angle: result.get_word(&table.current_angle),
            },
            control: TumControl {
                auto_temp_mode: result.get_bit(&table.auto_temp_mode),
                manual_control: result.get_bit(&table.manual_control),
                manual_temp_mode: result.get_bit(&table.manual_temp_mode),
                sync_to_tracker: result.get_bit(&table.sync_to_tracker),
            },
            sensors: TumSensors {
                humidity: result.get_word(&table.humidity),
                temperature: result.get_word(&table.temperature),
            },
            state: TumStateFlags {
                cover_closed: result.get_bit(&table.cover_closed),
                motor_failed: table
                    .motor_failed
                    .as_ref()
                    .and_then(|address| result.get_bit(address)),
                rain: result.get_bit(&table.rain),
                reset_needed: result.get_bit(&table.reset_needed),
                ups_alert: result.get_bit(&table.ups_alert),
            },
            power: TumPower {
                camera: result.get_bit(&table.power_camera),
                computer: result.get_bit(&table.power_computer),
                heater: result.get_bit(&table.power_heater),
                router: result.get_bit(&table.power_router),
                spectrometer: result.get_bit(&table.power_spectrometer),
            },
            connections: TumConnections {
                camera: result.get_bit(&table.connection_camera),
                computer: result.get_bit(&table.connection_computer),
                heater: result.get_bit(&table.connection_heater),
                router: result.get_bit(&table.connection_router),
                spectrometer: result.get_bit(&table.connection_spectrometer),
            },
        };
        self.last_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn read_back_bit(&mut self, address: &PlcAddress) -> Result<Option<bool>> {
        let bytes = self
            .plc
            .read_db(address.db_number, address.byte_offset, 1)?;
        let bit_index = match address.bit_index {
            Some(index) => index,
            None => return Ok(None),
        };
        Ok(bytes.first().map(|byte| byte & (1 << bit_index) != 0))
    }

    /// Write a control bit and verify the echoed value.
    fn verified_write_bit(&mut self, name: &str, address: PlcAddress, value: bool) -> Result<()> {
        let bit_index = address.bit_index.ok_or_else(|| PyraError::Plc {
            operation: name.to_string(),
            details: "field is not a bit".to_string(),
        })?;
        for attempt in 1..=VERIFY_ATTEMPTS {
            self.plc
                .write_bit(address.db_number, address.byte_offset, bit_index, value)?;
            self.settle()?;
            if self.read_back_bit(&address)? == Some(value) {
                return Ok(());
            }
            debug!(field = name, attempt, "PLC write not echoed yet");
        }
        Err(PyraError::Plc {
            operation: name.to_string(),
            details: format!("write of {} was not echoed back", value),
        })
    }

    pub fn set_sync_to_tracker(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("sync_to_tracker", self.table.sync_to_tracker, value)
    }

    pub fn set_manual_control(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("manual_control", self.table.manual_control, value)
    }

    pub fn set_auto_temperature(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("auto_temp_mode", self.table.auto_temp_mode, value)
    }

    pub fn set_manual_temperature(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("manual_temp_mode", self.table.manual_temp_mode, value)
    }

    pub fn set_power_camera(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("power_camera", self.table.power_camera, value)
    }

    pub fn set_power_computer(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("power_computer", self.table.power_computer, value)
    }

    pub fn set_power_heater(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("power_heater", self.table.power_heater, value)
    }

    pub fn set_power_router(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("power_router", self.table.power_router, value)
    }

    pub fn set_power_spectrometer(&mut self, value: bool) -> Result<()> {
        self.verified_write_bit("power_spectrometer", self.table.power_spectrometer, value)
    }

    /// Pulse the reset bit. Version 1 hardware resets on a low write,
    /// version 2 on a high write. Fire-and-forget, never verified.
    pub fn reset(&mut self) -> Result<()> {
        let address = self.table.reset;
        let bit_index = address.bit_index.unwrap_or(0);
        let value = self.table.version != 1;
        self.plc
            .write_bit(address.db_number, address.byte_offset, bit_index, value)
    }

    /// Write the cover angle setpoint register. Not verified; callers
    /// wait for `actors.current_angle` to converge instead.
    pub fn set_cover_angle(&mut self, angle: i64) -> Result<()> {
        let address = self.table.cover_angle_setpoint;
        let word = (angle as i16).to_be_bytes();
        self.plc
            .write_db(address.db_number, address.byte_offset, &word)
    }

    fn rain_is_asserted(&mut self) -> Result<bool> {
        let rain = self.table.rain;
        Ok(self.read_back_bit(&rain)?.unwrap_or(false))
    }

    /// Request a cover move. Refused (logged, returns Ok) while rain is
    /// asserted.
    pub fn move_cover(&mut self, angle: i64) -> Result<()> {
        if self.rain_is_asserted()? {
            debug!(angle, "Rain asserted, refusing to move cover");
            return Ok(());
        }
        self.set_cover_angle(angle)
    }

    /// Poll `current_angle` until it is within ±3° of `target`.
    pub fn wait_for_cover_angle(&mut self, target: i64) -> Result<()> {
        self.wait_for_cover_angle_with(target, COVER_CONVERGENCE_TIMEOUT, Duration::from_millis(500))
    }

    pub fn wait_for_cover_angle_with(
        &mut self,
        target: i64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let angle = self
                .plc
                .read_db(
                    self.table.current_angle.db_number,
                    self.table.current_angle.byte_offset,
                    2,
                )
                .map(|bytes| i16::from_be_bytes([bytes[0], bytes[1]]) as i64)?;
            if (angle - target).abs() <= 3 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PyraError::Plc {
                    operation: "cover convergence".to_string(),
                    details: format!("cover stuck at {}°, target {}°", angle, target),
                });
            }
            thread::sleep(poll_interval);
        }
    }

    /// Detach the cover from the tracker and drive it shut. Succeeds only
    /// once `state.cover_closed` is reported.
    pub fn force_cover_close(&mut self) -> Result<()> {
        self.force_cover_close_with(COVER_CLOSE_TIMEOUT, Duration::from_millis(500))
    }

    pub fn force_cover_close_with(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        self.set_sync_to_tracker(false)?;
        self.move_cover(0)?;
        let cover_closed = self.table.cover_closed;
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_back_bit(&cover_closed)? == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PyraError::Plc {
                    operation: "cover close".to_string(),
                    details: "cover did not report closed in time".to_string(),
                });
            }
            thread::sleep(poll_interval);
        }
    }

    pub fn last_snapshot(&self) -> Option<&TumEnclosureState> {
        self.last_snapshot.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory PLC: a byte array per DB, writes land immediately.
    pub(crate) struct MockPlc {
        pub blocks: HashMap<u16, Vec<u8>>,
        /// When set, bit writes are swallowed (simulates a stuck output).
        pub drop_writes: bool,
        /// Remaining polls that report the CPU cycle as busy.
        pub busy_polls_remaining: usize,
        pub cpu_polls: usize,
    }

    impl MockPlc {
        pub fn for_version(version: u8) -> Self {
            let mut blocks = HashMap::new();
            for (db_number, size) in PlcAddressTable::for_version(version).bulk_reads.clone() {
                blocks.insert(db_number, vec![0u8; size as usize]);
            }
            Self {
                blocks,
                drop_writes: false,
                busy_polls_remaining: 0,
                cpu_polls: 0,
            }
        }

        pub fn set_bit(&mut self, db_number: u16, byte_offset: u16, bit_index: u8, value: bool) {
            let byte = &mut self.blocks.get_mut(&db_number).unwrap()[byte_offset as usize];
            if value {
                *byte |= 1 << bit_index;
            } else {
                *byte &= !(1 << bit_index);
            }
        }

        pub fn set_word(&mut self, db_number: u16, byte_offset: u16, value: i16) {
            let block = self.blocks.get_mut(&db_number).unwrap();
            let bytes = value.to_be_bytes();
            block[byte_offset as usize] = bytes[0];
            block[byte_offset as usize + 1] = bytes[1];
        }
    }

    impl PlcInterface for MockPlc {
        fn read_db(&mut self, db_number: u16, start: u16, size: u16) -> Result<Vec<u8>> {
            let block = self.blocks.get(&db_number).ok_or_else(|| PyraError::Plc {
                operation: "read".to_string(),
                details: format!("no DB{}", db_number),
            })?;
            Ok(block[start as usize..(start + size) as usize].to_vec())
        }

        fn write_db(&mut self, db_number: u16, start: u16, data: &[u8]) -> Result<()> {
            if self.drop_writes {
                return Ok(());
            }
            let block = self.blocks.get_mut(&db_number).unwrap();
            block[start as usize..start as usize + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn write_bit(
            &mut self,
            db_number: u16,
            byte_offset: u16,
            bit_index: u8,
            value: bool,
        ) -> Result<()> {
            if self.drop_writes {
                return Ok(());
            }
            self.set_bit(db_number, byte_offset, bit_index, value);
            Ok(())
        }

        fn cpu_is_busy(&mut self) -> Result<bool> {
            self.cpu_polls += 1;
            if self.busy_polls_remaining > 0 {
                self.busy_polls_remaining -= 1;
                return Ok(true);
            }
            Ok(false)
        }
    }

    fn test_config(version: u8) -> TumEnclosureConfig {
        TumEnclosureConfig {
            ip: "10.0.0.4".to_string(),
            version,
            controlled_by_user: false,
        }
    }

    fn driver(version: u8) -> TumEnclosureDriver<MockPlc> {
        TumEnclosureDriver::with_session(MockPlc::for_version(version), test_config(version))
    }

    #[test]
    fn test_read_decodes_full_snapshot() {
        let mut driver = driver(1);
        driver.plc.set_word(8, 6, 123); // current angle
        driver.plc.set_word(8, 20, -5); // temperature
        driver.plc.set_bit(8, 24, 0, true); // rain
        driver.plc.set_bit(25, 8, 4, true); // spectrometer power
        driver.plc.set_bit(3, 0, 6, true); // sync to tracker

        let snapshot = driver.read().unwrap();
        assert_eq!(snapshot.actors.current_angle, Some(123));
        assert_eq!(snapshot.sensors.temperature, Some(-5));
        assert_eq!(snapshot.state.rain, Some(true));
        assert_eq!(snapshot.state.motor_failed, Some(false));
        assert_eq!(snapshot.power.spectrometer, Some(true));
        assert_eq!(snapshot.control.sync_to_tracker, Some(true));
        assert!(snapshot.last_full_fetch.is_some());
    }

    #[test]
    fn test_v2_snapshot_has_no_motor_failed() {
        let mut driver = driver(2);
        let snapshot = driver.read().unwrap();
        assert_eq!(snapshot.state.motor_failed, None);
        assert_eq!(snapshot.state.cover_closed, Some(false));
    }

    #[test]
    fn test_read_waits_out_busy_cpu_between_bulk_reads() {
        let mut driver = driver(1);
        driver.plc.busy_polls_remaining = 3;
        driver.read().unwrap();
        // three bulk reads mean two settles: the first eats the scripted
        // busy replies plus one idle poll, the second polls once
        assert_eq!(driver.plc.cpu_polls, 5);
        assert_eq!(driver.plc.busy_polls_remaining, 0);
    }

    #[test]
    fn test_settle_is_bounded_when_cpu_stays_busy() {
        let mut driver = driver(1);
        driver.plc.busy_polls_remaining = usize::MAX;
        let started = Instant::now();
        driver.read().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_verified_write_success() {
        let mut driver = driver(1);
        driver.set_sync_to_tracker(true).unwrap();
        let snapshot = driver.read().unwrap();
        assert_eq!(snapshot.control.sync_to_tracker, Some(true));
    }

    #[test]
    fn test_verified_write_mismatch_is_plc_error() {
        let mut driver = driver(1);
        driver.plc.drop_writes = true;
        let error = driver.set_sync_to_tracker(true).unwrap_err();
        assert_eq!(error.subject(), "plc-error");
    }

    #[test]
    fn test_reset_polarity_per_version() {
        let mut v1_driver = driver(1);
        v1_driver.plc.set_bit(3, 0, 4, true);
        v1_driver.reset().unwrap();
        assert_eq!(v1_driver.plc.blocks[&3][0] & (1 << 4), 0, "v1 writes false");

        let mut v2_driver = driver(2);
        v2_driver.reset().unwrap();
        assert_ne!(v2_driver.plc.blocks[&3][0] & (1 << 4), 0, "v2 writes true");
    }

    #[test]
    fn test_move_cover_refused_while_raining() {
        let mut driver = driver(1);
        driver.plc.set_bit(8, 24, 0, true); // rain
        driver.move_cover(120).unwrap();
        // setpoint register untouched
        assert_eq!(&driver.plc.blocks[&3][4..6], &[0, 0]);
    }

    #[test]
    fn test_move_cover_writes_setpoint_when_dry() {
        let mut driver = driver(1);
        driver.move_cover(120).unwrap();
        assert_eq!(&driver.plc.blocks[&3][4..6], &120i16.to_be_bytes());
    }

    #[test]
    fn test_cover_convergence_within_tolerance() {
        let mut driver = driver(1);
        driver.plc.set_word(8, 6, 118); // within ±3 of 120
        driver
            .wait_for_cover_angle_with(120, Duration::from_millis(100), Duration::from_millis(5))
            .unwrap();
    }

    #[test]
    fn test_cover_convergence_timeout() {
        let mut driver = driver(1);
        driver.plc.set_word(8, 6, 40);
        let error = driver
            .wait_for_cover_angle_with(120, Duration::from_millis(30), Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(error.subject(), "plc-error");
    }

    #[test]
    fn test_force_cover_close_reports_closed() {
        let mut driver = driver(1);
        driver.plc.set_bit(3, 0, 6, true); // synced
        driver.plc.set_bit(8, 24, 2, true); // already closed
        driver
            .force_cover_close_with(Duration::from_millis(100), Duration::from_millis(5))
            .unwrap();
        assert_eq!(driver.plc.blocks[&3][0] & (1 << 6), 0, "sync detached");
    }

    #[test]
    fn test_force_cover_close_timeout() {
        let mut driver = driver(1);
        let error = driver
            .force_cover_close_with(Duration::from_millis(30), Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(error.subject(), "plc-error");
    }
}
