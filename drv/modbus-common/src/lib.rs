// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MODBUS PDU construction/parsing and wire framing shared by the TCP,
//! RTU and ASCII backend adapters (spec.md §4.6.2; `modbus_serial_base.py`,
//! `modbus_tcp.py`, `modbus_rtu.py`, `modbus_ascii.py`).

use mapping_engine::{function_code as fc, ModbusAction};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModbusError {
    #[error("write action is missing register/coil values")]
    MissingValues,
    #[error("unsupported MODBUS function code: {0:#04x}")]
    UnsupportedFunction(u8),
    #[error("empty MODBUS response")]
    EmptyResponse,
    #[error("MODBUS exception: function={function:#04x} code={code:#04x}")]
    Exception { function: u8, code: u8 },
    #[error("unexpected MODBUS function code in response: expected={expected:#04x} got={got:#04x}")]
    FunctionMismatch { expected: u8, got: u8 },
    #[error("MODBUS response missing byte count")]
    MissingByteCount,
    #[error("incomplete MODBUS payload: expected {expected} got {got}")]
    IncompletePayload { expected: usize, got: usize },
    #[error("register payload length must be even")]
    OddPayloadLength,
    #[error("MODBUS RTU CRC mismatch")]
    CrcMismatch,
    #[error("MODBUS ASCII LRC mismatch")]
    LrcMismatch,
    #[error("invalid MODBUS ASCII frame delimiters")]
    InvalidAsciiDelimiters,
    #[error("invalid MODBUS ASCII payload length")]
    InvalidAsciiPayloadLength,
    #[error("invalid MODBUS ASCII hex payload")]
    InvalidAsciiHex,
    #[error("MODBUS ASCII payload too short")]
    AsciiPayloadTooShort,
    #[error("MODBUS RTU response too short to contain a unit address and CRC")]
    RtuResponseTooShort,
}

const READ_FUNCTIONS: [u8; 4] = [fc::READ_COILS, fc::READ_DISCRETE_INPUTS, fc::READ_HOLDING_REGISTERS, fc::READ_INPUT_REGISTERS];
const WRITE_SINGLE_FUNCTIONS: [u8; 2] = [fc::WRITE_SINGLE_COIL, fc::WRITE_SINGLE_REGISTER];
const REGISTER_READ_FUNCTIONS: [u8; 2] = [fc::READ_HOLDING_REGISTERS, fc::READ_INPUT_REGISTERS];
const COIL_READ_FUNCTIONS: [u8; 2] = [fc::READ_COILS, fc::READ_DISCRETE_INPUTS];

/// Builds the function-code-specific PDU body for `action`
/// (`modbus_serial_base.py:_build_pdu`, shared verbatim by TCP/RTU/ASCII).
pub fn build_pdu(action: &ModbusAction) -> Result<Vec<u8>, ModbusError> {
    let f = action.function_code;

    if READ_FUNCTIONS.contains(&f) {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(f);
        pdu.extend_from_slice(&action.address.to_be_bytes());
        pdu.extend_from_slice(&action.count.to_be_bytes());
        return Ok(pdu);
    }

    if WRITE_SINGLE_FUNCTIONS.contains(&f) {
        let value = *action.values.first().ok_or(ModbusError::MissingValues)?;
        let mut pdu = Vec::with_capacity(5);
        pdu.push(f);
        pdu.extend_from_slice(&action.address.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        return Ok(pdu);
    }

    if f == fc::WRITE_MULTIPLE_REGISTERS {
        if action.values.is_empty() {
            return Err(ModbusError::MissingValues);
        }
        let count = action.values.len() as u16;
        let byte_count = (count * 2) as u8;
        let mut pdu = Vec::with_capacity(6 + action.values.len() * 2);
        pdu.push(f);
        pdu.extend_from_slice(&action.address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        pdu.push(byte_count);
        for value in &action.values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        return Ok(pdu);
    }

    Err(ModbusError::UnsupportedFunction(f))
}

/// The decoded result of a MODBUS transaction, ready for ASCII rendering
/// by a calling adapter (`modbus_serial_base.py:_decode_response`).
pub enum ModbusResult {
    /// Raw register contents for a read-registers function; the caller
    /// (holding the rule's `data_type`/`response_scale`) renders these
    /// with [`mapping_engine::decode_registers`].
    Registers(Vec<u16>),
    /// One ASCII `'0'`/`'1'` character per requested coil/input bit.
    Bits(String),
    /// A write acknowledged successfully.
    Ok,
}

/// Parses `response_pdu` (the PDU with its leading function-code byte,
/// no transport framing) against the action that produced it
/// (`modbus_serial_base.py:_decode_response`).
pub fn decode_response(action: &ModbusAction, response_pdu: &[u8]) -> Result<ModbusResult, ModbusError> {
    let (&function, rest) = response_pdu.split_first().ok_or(ModbusError::EmptyResponse)?;
    let expected = action.function_code;

    if function != expected {
        if function >= 0x80 {
            let code = rest.first().copied().unwrap_or(0);
            return Err(ModbusError::Exception { function, code });
        }
        return Err(ModbusError::FunctionMismatch { expected, got: function });
    }

    if REGISTER_READ_FUNCTIONS.contains(&expected) {
        let byte_count = *rest.first().ok_or(ModbusError::MissingByteCount)? as usize;
        let data = rest.get(1..).unwrap_or_default();
        if data.len() < byte_count {
            return Err(ModbusError::IncompletePayload { expected: byte_count, got: data.len() });
        }
        if byte_count % 2 != 0 {
            return Err(ModbusError::OddPayloadLength);
        }
        let registers = data[..byte_count].chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect();
        return Ok(ModbusResult::Registers(registers));
    }

    if COIL_READ_FUNCTIONS.contains(&expected) {
        let byte_count = *rest.first().ok_or(ModbusError::MissingByteCount)? as usize;
        let payload = rest.get(1..).unwrap_or_default();
        if payload.len() < byte_count {
            return Err(ModbusError::IncompletePayload { expected: byte_count, got: payload.len() });
        }
        let mut bits = String::with_capacity(action.count as usize);
        for idx in 0..action.count as usize {
            let byte_index = idx / 8;
            let bit_index = idx % 8;
            let bit = payload.get(byte_index).map(|b| (b >> bit_index) & 0x01 != 0).unwrap_or(false);
            bits.push(if bit { '1' } else { '0' });
        }
        return Ok(ModbusResult::Bits(bits));
    }

    Ok(ModbusResult::Ok)
}

/// Builds the 7-byte MBAP header for a MODBUS-TCP request
/// (`modbus_tcp.py:_build_mbap_header`).
pub fn build_mbap_header(transaction_id: u16, unit_id: u8, pdu_len: usize) -> [u8; 7] {
    let length = (1 + pdu_len) as u16;
    let mut header = [0u8; 7];
    header[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    header[2..4].copy_from_slice(&0u16.to_be_bytes());
    header[4..6].copy_from_slice(&length.to_be_bytes());
    header[6] = unit_id;
    header
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MbapError {
    #[error("transaction ID mismatch: sent {sent}, received {received}")]
    TransactionMismatch { sent: u16, received: u16 },
    #[error("invalid protocol ID: {0}")]
    InvalidProtocolId(u16),
}

/// Validates a received 7-byte MBAP header against the transaction that
/// was sent, returning the expected PDU length (`modbus_tcp.py:_send_request`).
pub fn parse_mbap_header(header: &[u8; 7], sent_transaction_id: u16) -> Result<usize, MbapError> {
    let received_tid = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]);

    if received_tid != sent_transaction_id {
        return Err(MbapError::TransactionMismatch { sent: sent_transaction_id, received: received_tid });
    }
    if protocol_id != 0 {
        return Err(MbapError::InvalidProtocolId(protocol_id));
    }
    Ok((length as usize).saturating_sub(1))
}

const MODBUS_CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// MODBUS RTU CRC16: reflected, polynomial 0xA001, initial value 0xFFFF.
/// `crc::CRC_16_MODBUS` matches this exact algorithm bit-for-bit
/// (`modbus_rtu.py:_crc16`).
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC16.checksum(data)
}

/// Builds a MODBUS RTU frame: `unit_id || pdu || crc16` with the CRC in
/// little-endian wire order (`modbus_rtu.py:_build_rtu_frame`).
pub fn build_rtu_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + pdu.len() + 2);
    body.push(unit_id);
    body.extend_from_slice(pdu);
    let crc = crc16(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

/// The byte length an RTU response frame is expected to reach once its
/// unit/function/byte-count prefix is known, or `None` if not yet
/// determinable from `prefix` (`modbus_rtu.py:_expected_frame_length`).
pub fn expected_rtu_frame_length(prefix: &[u8]) -> Option<usize> {
    if prefix.len() < 3 {
        return None;
    }
    let function = prefix[1];
    if READ_FUNCTIONS.contains(&function) {
        let byte_count = prefix[2] as usize;
        Some(3 + byte_count + 2)
    } else if WRITE_SINGLE_FUNCTIONS.contains(&function) || function == fc::WRITE_MULTIPLE_REGISTERS {
        Some(8)
    } else if function >= 0x80 {
        Some(5)
    } else {
        None
    }
}

/// Validates and strips an RTU response frame's unit address and CRC,
/// returning the PDU (`modbus_rtu.py:_read_response`, frame-complete branch).
/// A frame too short to hold a unit address plus CRC (e.g. an empty buffer
/// from a read timeout) is rejected rather than panicking on the split.
pub fn parse_rtu_frame(frame: &[u8], expected_unit_id: u8) -> Result<Option<Vec<u8>>, ModbusError> {
    if frame.len() < 3 {
        return Err(ModbusError::RtuResponseTooShort);
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let crc_received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if crc16(body) != crc_received {
        return Err(ModbusError::CrcMismatch);
    }
    if body[0] != expected_unit_id {
        return Ok(None);
    }
    Ok(Some(body[1..].to_vec()))
}

/// MODBUS ASCII LRC: two's complement of the sum of all bytes, truncated
/// to 8 bits (`modbus_ascii.py:_lrc`).
pub fn lrc(data: &[u8]) -> u8 {
    let total: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    total.wrapping_neg()
}

/// Builds a MODBUS ASCII frame: `:` + uppercase hex of
/// `unit_id || pdu || lrc` + `\r\n` (`modbus_ascii.py:_build_ascii_frame`).
pub fn build_ascii_frame(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + pdu.len() + 1);
    payload.push(unit_id);
    payload.extend_from_slice(pdu);
    payload.push(lrc(&payload));

    let mut frame = Vec::with_capacity(1 + payload.len() * 2 + 2);
    frame.push(b':');
    for byte in &payload {
        frame.extend_from_slice(format!("{byte:02X}").as_bytes());
    }
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Parses one complete `:...\r\n` MODBUS ASCII line, validating framing
/// and LRC, returning `None` if the frame targets a different unit
/// (`modbus_ascii.py:_parse_frame`).
pub fn parse_ascii_frame(line: &[u8], expected_unit_id: u8) -> Result<Option<Vec<u8>>, ModbusError> {
    if !line.starts_with(b":") || !line.ends_with(b"\r\n") {
        return Err(ModbusError::InvalidAsciiDelimiters);
    }
    let hex_payload = &line[1..line.len() - 2];
    if hex_payload.len() < 4 || hex_payload.len() % 2 != 0 {
        return Err(ModbusError::InvalidAsciiPayloadLength);
    }

    let mut data = Vec::with_capacity(hex_payload.len() / 2);
    for chunk in hex_payload.chunks_exact(2) {
        let text = std::str::from_utf8(chunk).map_err(|_| ModbusError::InvalidAsciiHex)?;
        let byte = u8::from_str_radix(text, 16).map_err(|_| ModbusError::InvalidAsciiHex)?;
        data.push(byte);
    }

    if data.len() < 3 {
        return Err(ModbusError::AsciiPayloadTooShort);
    }

    let unit = data[0];
    if unit != expected_unit_id {
        return Ok(None);
    }

    let checksum = *data.last().unwrap();
    let payload = &data[..data.len() - 1];
    if lrc(payload) != checksum {
        return Err(ModbusError::LrcMismatch);
    }

    let function = data[1];
    if function >= 0x80 {
        let code = data.get(2).copied().unwrap_or(0);
        return Err(ModbusError::Exception { function, code });
    }

    Ok(Some(data[1..data.len() - 1].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapping_engine::DataType;

    fn read_action() -> ModbusAction {
        ModbusAction { function_code: fc::READ_HOLDING_REGISTERS, address: 0, count: 2, values: vec![], data_type: DataType::Float32Be, response_scale: None }
    }

    #[test]
    fn build_pdu_for_read_holding_registers() {
        let pdu = build_pdu(&read_action()).unwrap();
        assert_eq!(pdu, vec![0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn build_pdu_for_write_multiple_registers() {
        let action = ModbusAction { function_code: fc::WRITE_MULTIPLE_REGISTERS, address: 10, count: 2, values: vec![0x0102, 0x0304], data_type: DataType::Uint16, response_scale: None };
        let pdu = build_pdu(&action).unwrap();
        assert_eq!(pdu, vec![0x10, 0x00, 0x0a, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn decode_response_extracts_registers() {
        let action = read_action();
        let pdu = [0x03, 0x04, 0x41, 0xcc, 0x00, 0x00];
        match decode_response(&action, &pdu).unwrap() {
            ModbusResult::Registers(regs) => assert_eq!(regs, vec![0x41cc, 0x0000]),
            _ => panic!("expected registers"),
        }
    }

    #[test]
    fn decode_response_surfaces_exception_code() {
        let action = read_action();
        let pdu = [0x83, 0x02];
        let err = decode_response(&action, &pdu).unwrap_err();
        assert_eq!(err, ModbusError::Exception { function: 0x83, code: 0x02 });
    }

    #[test]
    fn mbap_header_round_trips_transaction_id_and_length() {
        let header = build_mbap_header(7, 1, 5);
        let pdu_len = parse_mbap_header(&header, 7).unwrap();
        assert_eq!(pdu_len, 5);
    }

    #[test]
    fn mbap_header_rejects_mismatched_transaction_id() {
        let header = build_mbap_header(7, 1, 5);
        assert!(matches!(parse_mbap_header(&header, 8), Err(MbapError::TransactionMismatch { .. })));
    }

    #[test]
    fn crc16_matches_known_modbus_test_vector() {
        // 01 03 00 00 00 01 -> CRC16 0x0A84, transmitted little-endian as 84 0A
        let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&body), 0x0a84);
    }

    #[test]
    fn rtu_frame_round_trips() {
        let pdu = build_pdu(&read_action()).unwrap();
        let frame = build_rtu_frame(1, &pdu);
        let parsed = parse_rtu_frame(&frame, 1).unwrap().unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn rtu_frame_detects_crc_mismatch() {
        let mut frame = build_rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert_eq!(parse_rtu_frame(&frame, 1).unwrap_err(), ModbusError::CrcMismatch);
    }

    #[test]
    fn rtu_frame_rejects_short_buffers_instead_of_panicking() {
        assert_eq!(parse_rtu_frame(&[], 1).unwrap_err(), ModbusError::RtuResponseTooShort);
        assert_eq!(parse_rtu_frame(&[0x01], 1).unwrap_err(), ModbusError::RtuResponseTooShort);
        assert_eq!(parse_rtu_frame(&[0x01, 0x02], 1).unwrap_err(), ModbusError::RtuResponseTooShort);
    }

    #[test]
    fn lrc_is_twos_complement_of_byte_sum() {
        assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0xfb);
    }

    #[test]
    fn ascii_frame_round_trips() {
        let pdu = build_pdu(&read_action()).unwrap();
        let frame = build_ascii_frame(1, &pdu);
        assert!(frame.starts_with(b":"));
        assert!(frame.ends_with(b"\r\n"));
        let parsed = parse_ascii_frame(&frame, 1).unwrap().unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn ascii_frame_for_other_unit_is_ignored() {
        let frame = build_ascii_frame(2, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(parse_ascii_frame(&frame, 1).unwrap(), None);
    }

    #[test]
    fn expected_rtu_frame_length_for_read_uses_byte_count() {
        assert_eq!(expected_rtu_frame_length(&[0x01, 0x03, 0x04]), Some(9));
    }
}
