// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Per-version PLC address tables.
//!
//! The two enclosure generations lay out their data blocks differently.
//! A [`PlcAddressTable`] maps logical field names to `(db, byte, size,
//! bit)` tuples and lists the contiguous bulk reads that cover all of
//! them. Version 2 dropped the motor-failed flag.

use std::collections::HashMap;

/// Location of one logical field inside a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlcAddress {
    pub db_number: u16,
    pub byte_offset: u16,
    pub size: u16,
    /// Set for boolean fields.
    pub bit_index: Option<u8>,
}

impl PlcAddress {
    const fn word(db_number: u16, byte_offset: u16) -> Self {
        Self {
            db_number,
            byte_offset,
            size: 2,
            bit_index: None,
        }
    }

    const fn bit(db_number: u16, byte_offset: u16, bit_index: u8) -> Self {
        Self {
            db_number,
            byte_offset,
            size: 1,
            bit_index: Some(bit_index),
        }
    }
}

/// Address layout of one PLC generation.
#[derive(Debug, Clone)]
pub struct PlcAddressTable {
    pub version: u8,
    /// `(db_number, size_in_bytes)` of each bulk read.
    pub bulk_reads: Vec<(u16, u16)>,

    // control (DB3)
    pub auto_temp_mode: PlcAddress,
    pub manual_control: PlcAddress,
    pub manual_temp_mode: PlcAddress,
    pub sync_to_tracker: PlcAddress,
    pub reset: PlcAddress,
    pub cover_angle_setpoint: PlcAddress,

    // actors + sensors + flags
    pub fan_speed: PlcAddress,
    pub current_angle: PlcAddress,
    pub temperature: PlcAddress,
    pub humidity: PlcAddress,
    pub rain: PlcAddress,
    pub reset_needed: PlcAddress,
    pub cover_closed: PlcAddress,
    /// Absent on version 2 hardware.
    pub motor_failed: Option<PlcAddress>,
    pub ups_alert: PlcAddress,

    // power rails + connection rails (one flag byte each)
    pub power_camera: PlcAddress,
    pub power_computer: PlcAddress,
    pub power_heater: PlcAddress,
    pub power_router: PlcAddress,
    pub power_spectrometer: PlcAddress,
    pub connection_camera: PlcAddress,
    pub connection_computer: PlcAddress,
    pub connection_heater: PlcAddress,
    pub connection_router: PlcAddress,
    pub connection_spectrometer: PlcAddress,
}

impl PlcAddressTable {
    /// Table for the given hardware generation. Only versions 1 and 2
    /// exist; config validation guarantees the range.
    pub fn for_version(version: u8) -> Self {
        match version {
            1 => Self::version_1(),
            _ => Self::version_2(),
        }
    }

    fn version_1() -> Self {
        Self {
            version: 1,
            bulk_reads: vec![(3, 6), (8, 26), (25, 10)],

            auto_temp_mode: PlcAddress::bit(3, 0, 2),
            manual_temp_mode: PlcAddress::bit(3, 0, 3),
            reset: PlcAddress::bit(3, 0, 4),
            manual_control: PlcAddress::bit(3, 0, 5),
            sync_to_tracker: PlcAddress::bit(3, 0, 6),
            cover_angle_setpoint: PlcAddress::word(3, 4),

            fan_speed: PlcAddress::word(8, 4),
            current_angle: PlcAddress::word(8, 6),
            temperature: PlcAddress::word(8, 20),
            humidity: PlcAddress::word(8, 22),
            rain: PlcAddress::bit(8, 24, 0),
            reset_needed: PlcAddress::bit(8, 24, 1),
            cover_closed: PlcAddress::bit(8, 24, 2),
            motor_failed: Some(PlcAddress::bit(8, 24, 3)),
            ups_alert: PlcAddress::bit(8, 24, 4),

            power_camera: PlcAddress::bit(25, 8, 0),
            power_computer: PlcAddress::bit(25, 8, 1),
            power_heater: PlcAddress::bit(25, 8, 2),
            power_router: PlcAddress::bit(25, 8, 3),
            power_spectrometer: PlcAddress::bit(25, 8, 4),
            connection_camera: PlcAddress::bit(25, 9, 0),
            connection_computer: PlcAddress::bit(25, 9, 1),
            connection_heater: PlcAddress::bit(25, 9, 2),
            connection_router: PlcAddress::bit(25, 9, 3),
            connection_spectrometer: PlcAddress::bit(25, 9, 4),
        }
    }

    fn version_2() -> Self {
        Self {
            version: 2,
            bulk_reads: vec![(3, 5), (6, 17), (8, 25)],

            auto_temp_mode: PlcAddress::bit(3, 0, 2),
            manual_temp_mode: PlcAddress::bit(3, 0, 3),
            reset: PlcAddress::bit(3, 0, 4),
            manual_control: PlcAddress::bit(3, 0, 5),
            sync_to_tracker: PlcAddress::bit(3, 0, 6),
            cover_angle_setpoint: PlcAddress::word(3, 3),

            fan_speed: PlcAddress::word(8, 4),
            current_angle: PlcAddress::word(8, 6),
            temperature: PlcAddress::word(8, 18),
            humidity: PlcAddress::word(8, 20),
            rain: PlcAddress::bit(8, 24, 0),
            reset_needed: PlcAddress::bit(8, 24, 1),
            cover_closed: PlcAddress::bit(8, 24, 2),
            motor_failed: None,
            ups_alert: PlcAddress::bit(8, 24, 4),

            power_camera: PlcAddress::bit(6, 15, 0),
            power_computer: PlcAddress::bit(6, 15, 1),
            power_heater: PlcAddress::bit(6, 15, 2),
            power_router: PlcAddress::bit(6, 15, 3),
            power_spectrometer: PlcAddress::bit(6, 15, 4),
            connection_camera: PlcAddress::bit(6, 16, 0),
            connection_computer: PlcAddress::bit(6, 16, 1),
            connection_heater: PlcAddress::bit(6, 16, 2),
            connection_router: PlcAddress::bit(6, 16, 3),
            connection_spectrometer: PlcAddress::bit(6, 16, 4),
        }
    }

    fn all_read_fields(&self) -> Vec<&PlcAddress> {
        let mut fields = vec![
            &self.auto_temp_mode,
            &self.manual_control,
            &self.manual_temp_mode,
            &self.sync_to_tracker,
            &self.cover_angle_setpoint,
            &self.fan_speed,
            &self.current_angle,
            &self.temperature,
            &self.humidity,
            &self.rain,
            &self.reset_needed,
            &self.cover_closed,
            &self.ups_alert,
            &self.power_camera,
            &self.power_computer,
            &self.power_heater,
            &self.power_router,
            &self.power_spectrometer,
            &self.connection_camera,
            &self.connection_computer,
            &self.connection_heater,
            &self.connection_router,
            &self.connection_spectrometer,
        ];
        if let Some(address) = self.motor_failed.as_ref() {
            fields.push(address);
        }
        fields
    }
}

/// Result of the fixed bulk reads, keyed by DB number.
#[derive(Debug, Default)]
pub struct BulkReadResult {
    blocks: HashMap<u16, Vec<u8>>,
}

impl BulkReadResult {
    pub fn insert(&mut self, db_number: u16, bytes: Vec<u8>) {
        self.blocks.insert(db_number, bytes);
    }

    /// Decode a boolean field; `None` when the block is missing or short.
    pub fn get_bit(&self, address: &PlcAddress) -> Option<bool> {
        let bit_index = address.bit_index?;
        let byte = self
            .blocks
            .get(&address.db_number)?
            .get(address.byte_offset as usize)?;
        Some(byte & (1 << bit_index) != 0)
    }

    /// Decode a big-endian 16-bit integer field.
    pub fn get_word(&self, address: &PlcAddress) -> Option<i64> {
        let block = self.blocks.get(&address.db_number)?;
        let offset = address.byte_offset as usize;
        let bytes = block.get(offset..offset + 2)?;
        Some(i16::from_be_bytes([bytes[0], bytes[1]]) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_read_sizes_per_version() {
        assert_eq!(
            PlcAddressTable::for_version(1).bulk_reads,
            vec![(3, 6), (8, 26), (25, 10)]
        );
        assert_eq!(
            PlcAddressTable::for_version(2).bulk_reads,
            vec![(3, 5), (6, 17), (8, 25)]
        );
    }

    #[test]
    fn test_motor_failed_absent_on_v2() {
        assert!(PlcAddressTable::for_version(1).motor_failed.is_some());
        assert!(PlcAddressTable::for_version(2).motor_failed.is_none());
    }

    #[test]
    fn test_all_fields_covered_by_bulk_reads() {
        for version in [1, 2] {
            let table = PlcAddressTable::for_version(version);
            for address in table.all_read_fields() {
                let (_, size) = table
                    .bulk_reads
                    .iter()
                    .find(|(db, _)| *db == address.db_number)
                    .copied()
                    .unwrap_or_else(|| panic!("v{}: DB{} not read", version, address.db_number));
                assert!(
                    address.byte_offset + address.size <= size,
                    "v{}: DB{} field at byte {} exceeds bulk size {}",
                    version,
                    address.db_number,
                    address.byte_offset,
                    size
                );
            }
        }
    }

    #[test]
    fn test_decode_word_and_bit() {
        let table = PlcAddressTable::for_version(1);
        let mut result = BulkReadResult::default();
        let mut db8 = vec![0u8; 26];
        db8[6] = 0x00;
        db8[7] = 0x5A; // current angle 90
        db8[20] = 0xFF;
        db8[21] = 0xF6; // temperature -10
        db8[24] = 0b0000_0101; // rain + cover_closed
        result.insert(8, db8);

        assert_eq!(result.get_word(&table.current_angle), Some(90));
        assert_eq!(result.get_word(&table.temperature), Some(-10));
        assert_eq!(result.get_bit(&table.rain), Some(true));
        assert_eq!(result.get_bit(&table.reset_needed), Some(false));
        assert_eq!(result.get_bit(&table.cover_closed), Some(true));
        // DB3 not read: decode yields None
        assert_eq!(result.get_bit(&table.sync_to_tracker), None);
    }
}
