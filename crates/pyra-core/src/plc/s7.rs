// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Minimal Siemens S7 client (ISO-on-TCP, RFC 1006).
//!
//! Implements exactly what the enclosure needs: connect with COTP +
//! S7 setup-communication, bulk reads of DB byte ranges, byte writes and
//! single-bit writes. Frame building and parsing are pure functions so the
//! wire format is testable without a PLC.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::PyraError;

/// Connect deadline mandated by the driver contract.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read/write timeout on the established session.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// ISO-on-TCP port.
const ISO_TCP_PORT: u16 = 102;

/// S7 DB memory area.
const AREA_DB: u8 = 0x84;

/// Transport size codes.
const TS_BIT: u8 = 0x01;
const TS_BYTE: u8 = 0x02;

type S7Result<T> = Result<T, PyraError>;

fn plc_error(operation: &str, details: impl Into<String>) -> PyraError {
    PyraError::Plc {
        operation: operation.to_string(),
        details: details.into(),
    }
}

/// Wrap a payload in a TPKT header.
fn tpkt(payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 4) as u16;
    let mut frame = vec![0x03, 0x00, (length >> 8) as u8, (length & 0xFF) as u8];
    frame.extend_from_slice(payload);
    frame
}

/// COTP connection request for `rack`/`slot`.
pub(crate) fn build_cotp_connect(rack: u8, slot: u8) -> Vec<u8> {
    let dst_tsap = [0x01, (rack << 5) | slot];
    let payload = vec![
        0x11, // COTP length
        0xE0, // CR
        0x00, 0x00, // dst ref
        0x00, 0x01, // src ref
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // src TSAP
        0xC2, 0x02, dst_tsap[0], dst_tsap[1], // dst TSAP
    ];
    tpkt(&payload)
}

/// S7 setup-communication job.
pub(crate) fn build_setup_communication(pdu_ref: u16) -> Vec<u8> {
    let mut payload = cotp_data_header();
    payload.extend_from_slice(&[
        0x32, // S7 protocol id
        0x01, // job
        0x00, 0x00, // reserved
        (pdu_ref >> 8) as u8,
        (pdu_ref & 0xFF) as u8,
        0x00, 0x08, // parameter length
        0x00, 0x00, // data length
        0xF0, // setup communication
        0x00,
        0x00, 0x01, // max AMQ caller
        0x00, 0x01, // max AMQ callee
        0x01, 0xE0, // PDU length 480
    ]);
    tpkt(&payload)
}

fn cotp_data_header() -> Vec<u8> {
    vec![0x02, 0xF0, 0x80] // COTP DT, last unit
}

fn read_item(db_number: u16, transport_size: u8, bit_address: u32, count: u16) -> Vec<u8> {
    vec![
        0x12, // variable specification
        0x0A, // length of following address
        0x10, // syntax id: S7-any
        transport_size,
        (count >> 8) as u8,
        (count & 0xFF) as u8,
        (db_number >> 8) as u8,
        (db_number & 0xFF) as u8,
        AREA_DB,
        (bit_address >> 16) as u8,
        (bit_address >> 8) as u8,
        (bit_address & 0xFF) as u8,
    ]
}

/// Read-variable job for `size` bytes at `DB<db_number>.DBB<start>`.
pub(crate) fn build_read_request(pdu_ref: u16, db_number: u16, start: u16, size: u16) -> Vec<u8> {
    let mut payload = cotp_data_header();
    let item = read_item(db_number, TS_BYTE, (start as u32) * 8, size);
    payload.extend_from_slice(&[
        0x32, 0x01, 0x00, 0x00,
        (pdu_ref >> 8) as u8,
        (pdu_ref & 0xFF) as u8,
        0x00, (2 + item.len()) as u8, // parameter length
        0x00, 0x00, // data length
        0x04, // read var
        0x01, // one item
    ]);
    payload.extend_from_slice(&item);
    tpkt(&payload)
}

/// Write-variable job for raw bytes at `DB<db_number>.DBB<start>`.
pub(crate) fn build_write_bytes_request(
    pdu_ref: u16,
    db_number: u16,
    start: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut payload = cotp_data_header();
    let item = read_item(db_number, TS_BYTE, (start as u32) * 8, data.len() as u16);
    let data_len = 4 + data.len();
    payload.extend_from_slice(&[
        0x32, 0x01, 0x00, 0x00,
        (pdu_ref >> 8) as u8,
        (pdu_ref & 0xFF) as u8,
        0x00, (2 + item.len()) as u8,
        (data_len >> 8) as u8,
        (data_len & 0xFF) as u8,
        0x05, // write var
        0x01, // one item
    ]);
    payload.extend_from_slice(&item);
    payload.extend_from_slice(&[
        0x00, // return code (request)
        0x04, // transport size: byte/word/dword, length in bits
        ((data.len() * 8) >> 8) as u8,
        ((data.len() * 8) & 0xFF) as u8,
    ]);
    payload.extend_from_slice(data);
    tpkt(&payload)
}

/// Write-variable job for a single bit at `DB<db_number>.DBX<byte>.<bit>`.
pub(crate) fn build_write_bit_request(
    pdu_ref: u16,
    db_number: u16,
    byte_offset: u16,
    bit_index: u8,
    value: bool,
) -> Vec<u8> {
    let mut payload = cotp_data_header();
    let bit_address = (byte_offset as u32) * 8 + bit_index as u32;
    let item = read_item(db_number, TS_BIT, bit_address, 1);
    payload.extend_from_slice(&[
        0x32, 0x01, 0x00, 0x00,
        (pdu_ref >> 8) as u8,
        (pdu_ref & 0xFF) as u8,
        0x00, (2 + item.len()) as u8,
        0x00, 0x05, // data length: 4 header + 1 payload byte
        0x05, // write var
        0x01,
    ]);
    payload.extend_from_slice(&item);
    payload.extend_from_slice(&[
        0x00, // return code (request)
        0x03, // transport size: bit
        0x00, 0x01, // length 1
        if value { 0x01 } else { 0x00 },
    ]);
    tpkt(&payload)
}

/// S7 userdata job reading SZL 0x0424, the CPU status list.
pub(crate) fn build_cpu_state_request(pdu_ref: u16) -> Vec<u8> {
    let mut payload = cotp_data_header();
    payload.extend_from_slice(&[
        0x32, // S7 protocol id
        0x07, // userdata
        0x00, 0x00, // reserved
        (pdu_ref >> 8) as u8,
        (pdu_ref & 0xFF) as u8,
        0x00, 0x08, // parameter length
        0x00, 0x08, // data length
        // parameter: request, CPU functions, read SZL
        0x00, 0x01, 0x12, 0x04, 0x11, 0x44, 0x01, 0x00,
        // data: SZL-ID 0x0424, index 0
        0xFF, 0x09, 0x00, 0x04, 0x04, 0x24, 0x00, 0x00,
    ]);
    tpkt(&payload)
}

/// CPU mode byte of SZL 0x0424 while the cycle is in RUN.
pub(crate) const CPU_STATE_RUN: u8 = 0x08;

/// Extract the CPU mode byte from a read-SZL response.
pub(crate) fn parse_cpu_state_response(frame: &[u8]) -> S7Result<u8> {
    let pdu = s7_pdu(frame)?;
    if pdu.len() < 10 || pdu[0] != 0x32 || pdu[1] != 0x07 {
        return Err(plc_error("cpu-state", "not a userdata PDU"));
    }
    let param_len = u16::from_be_bytes([pdu[6], pdu[7]]) as usize;
    let data = pdu
        .get(10 + param_len..)
        .ok_or_else(|| plc_error("cpu-state", "truncated PDU"))?;
    if data.first().copied() != Some(0xFF) {
        return Err(plc_error(
            "cpu-state",
            format!(
                "item return code {:#x}",
                data.first().copied().unwrap_or(0)
            ),
        ));
    }
    // 4 byte data header, 8 byte partial list header, mode at record byte 3
    data.get(4 + 8 + 3)
        .copied()
        .ok_or_else(|| plc_error("cpu-state", "SZL record too short"))
}

/// Strip TPKT + COTP and return the S7 PDU.
fn s7_pdu(frame: &[u8]) -> S7Result<&[u8]> {
    if frame.len() < 7 {
        return Err(plc_error("parse", "frame shorter than TPKT+COTP"));
    }
    // TPKT (4) + COTP DT (3)
    Ok(&frame[7..])
}

/// Parse an ack-data header, checking the error class/code.
fn check_ack_header(pdu: &[u8], expected_function: u8) -> S7Result<(usize, usize)> {
    if pdu.len() < 12 || pdu[0] != 0x32 {
        return Err(plc_error("parse", "not an S7 PDU"));
    }
    if pdu[1] != 0x03 {
        return Err(plc_error("parse", format!("unexpected ROSCTR {}", pdu[1])));
    }
    let param_len = u16::from_be_bytes([pdu[6], pdu[7]]) as usize;
    let data_len = u16::from_be_bytes([pdu[8], pdu[9]]) as usize;
    let (error_class, error_code) = (pdu[10], pdu[11]);
    if error_class != 0 || error_code != 0 {
        return Err(plc_error(
            "request",
            format!("PLC error class {:#x} code {:#x}", error_class, error_code),
        ));
    }
    if pdu.len() < 12 + param_len + data_len {
        return Err(plc_error("parse", "truncated S7 PDU"));
    }
    if param_len < 1 || pdu[12] != expected_function {
        return Err(plc_error(
            "parse",
            format!("unexpected function {:#x}", pdu.get(12).copied().unwrap_or(0)),
        ));
    }
    Ok((12 + param_len, data_len))
}

/// Extract the payload bytes of a read-variable response.
pub(crate) fn parse_read_response(frame: &[u8], expected_size: usize) -> S7Result<Vec<u8>> {
    let pdu = s7_pdu(frame)?;
    let (data_start, _) = check_ack_header(pdu, 0x04)?;
    let data = &pdu[data_start..];
    if data.len() < 4 {
        return Err(plc_error("read", "missing data item"));
    }
    let return_code = data[0];
    if return_code != 0xFF {
        return Err(plc_error("read", format!("item return code {:#x}", return_code)));
    }
    let transport_size = data[1];
    let raw_length = u16::from_be_bytes([data[2], data[3]]) as usize;
    // Transport sizes 3..5 report the length in bits.
    let byte_length = match transport_size {
        0x03 | 0x04 | 0x05 => raw_length / 8,
        _ => raw_length,
    };
    let payload = data
        .get(4..4 + byte_length)
        .ok_or_else(|| plc_error("read", "payload shorter than declared"))?;
    if payload.len() < expected_size {
        return Err(plc_error(
            "read",
            format!("expected {} bytes, got {}", expected_size, payload.len()),
        ));
    }
    Ok(payload[..expected_size].to_vec())
}

/// Check the single item return code of a write-variable response.
pub(crate) fn parse_write_response(frame: &[u8]) -> S7Result<()> {
    let pdu = s7_pdu(frame)?;
    let (data_start, _) = check_ack_header(pdu, 0x05)?;
    let return_code = pdu
        .get(data_start)
        .copied()
        .ok_or_else(|| plc_error("write", "missing item return code"))?;
    if return_code != 0xFF {
        return Err(plc_error(
            "write",
            format!("item return code {:#x}", return_code),
        ));
    }
    Ok(())
}

/// A connected S7 session.
#[derive(Debug)]
pub struct S7Client {
    stream: TcpStream,
    pdu_ref: u16,
}

impl S7Client {
    /// Connect to `ip:102`, rack 0 / slot 1, within [`CONNECT_TIMEOUT`].
    pub fn connect(ip: &str) -> S7Result<Self> {
        let addr: SocketAddr = format!("{}:{}", ip, ISO_TCP_PORT)
            .parse()
            .map_err(|e| plc_error("connect", format!("bad address '{}': {}", ip, e)))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| plc_error("connect", format!("{}: {}", ip, e)))?;
        stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(IO_TIMEOUT)))
            .map_err(|e| plc_error("connect", e.to_string()))?;

        let mut client = Self { stream, pdu_ref: 0 };
        client.send(&build_cotp_connect(0, 1))?;
        let reply = client.receive()?;
        if reply.get(5).copied() != Some(0xD0) {
            return Err(plc_error("connect", "COTP connection refused"));
        }
        let pdu_ref = client.next_ref();
        client.send(&build_setup_communication(pdu_ref))?;
        let reply = client.receive()?;
        check_ack_header(s7_pdu(&reply)?, 0xF0)?;
        Ok(client)
    }

    /// Bulk read of `size` bytes from `DB<db_number>` starting at `start`.
    pub fn read_db(&mut self, db_number: u16, start: u16, size: u16) -> S7Result<Vec<u8>> {
        let pdu_ref = self.next_ref();
        self.send(&build_read_request(pdu_ref, db_number, start, size))?;
        let reply = self.receive()?;
        parse_read_response(&reply, size as usize)
    }

    /// Write raw bytes into `DB<db_number>` at `start`.
    pub fn write_db(&mut self, db_number: u16, start: u16, data: &[u8]) -> S7Result<()> {
        let pdu_ref = self.next_ref();
        self.send(&build_write_bytes_request(pdu_ref, db_number, start, data))?;
        let reply = self.receive()?;
        parse_write_response(&reply)
    }

    /// Write a single bit.
    pub fn write_bit(
        &mut self,
        db_number: u16,
        byte_offset: u16,
        bit_index: u8,
        value: bool,
    ) -> S7Result<()> {
        let pdu_ref = self.next_ref();
        self.send(&build_write_bit_request(
            pdu_ref, db_number, byte_offset, bit_index, value,
        ))?;
        let reply = self.receive()?;
        parse_write_response(&reply)
    }

    /// True while the CPU reports anything but RUN; requests sent in
    /// that window are rejected.
    pub fn cpu_is_busy(&mut self) -> S7Result<bool> {
        let pdu_ref = self.next_ref();
        self.send(&build_cpu_state_request(pdu_ref))?;
        let reply = self.receive()?;
        Ok(parse_cpu_state_response(&reply)? != CPU_STATE_RUN)
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    fn send(&mut self, frame: &[u8]) -> S7Result<()> {
        self.stream
            .write_all(frame)
            .map_err(|e| plc_error("send", e.to_string()))
    }

    fn receive(&mut self) -> S7Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .map_err(|e| plc_error("receive", e.to_string()))?;
        if header[0] != 0x03 {
            return Err(plc_error("receive", "bad TPKT version"));
        }
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if total < 4 || total > 8192 {
            return Err(plc_error("receive", format!("implausible frame size {}", total)));
        }
        let mut rest = vec![0u8; total - 4];
        self.stream
            .read_exact(&mut rest)
            .map_err(|e| plc_error("receive", e.to_string()))?;
        let mut frame = header.to_vec();
        frame.append(&mut rest);
        Ok(frame)
    }
}
