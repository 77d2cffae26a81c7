//! Modbus RTU frame encoding and decoding
//!
//! A frame on the wire is `[slave:1][function:1][data:N][crc:2]`, with the
//! CRC16 appended low byte first. This module is pure and does no I/O.

use thiserror::Error;

/// Longest permissible RTU frame, per the Modbus serial line spec.
pub const MAX_FRAME_LEN: usize = 256;

/// Function codes handled by this bus master.
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
}

/// Bit set on the function code of an exception reply.
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("device exception {code:#04x}: {desc}", code = .0, desc = exception_description(*.0))]
    DeviceException(u8),
}

/// A validated frame, CRC stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub slave: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(slave: u8, function: u8, payload: Vec<u8>) -> Self {
        Frame {
            slave,
            function,
            payload,
        }
    }

    /// Build a request frame for the codes in [`function`]; they all carry a
    /// 16-bit address followed by a 16-bit count or value.
    pub fn request(slave: u8, function: u8, address: u16, value: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
        Frame::new(slave, function, payload)
    }

    /// Serialize with the CRC appended low byte first.
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(4 + self.payload.len());
        raw.push(self.slave);
        raw.push(self.function);
        raw.extend_from_slice(&self.payload);
        raw.extend_from_slice(&crc16(&raw).to_le_bytes());
        raw
    }
}

/// Parse and validate a raw byte sequence as received from the line.
///
/// An exception reply (function code with the high bit set) decodes to
/// [`FrameError::DeviceException`] after its CRC has been verified, so line
/// noise is never mistaken for a device-reported error.
pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    if raw.len() < 4 {
        return Err(FrameError::Truncated(raw.len()));
    }

    let (body, crc) = raw.split_at(raw.len() - 2);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    let expected = crc16(body);
    if received != expected {
        return Err(FrameError::CrcMismatch { expected, received });
    }

    let function = body[1];
    if function & EXCEPTION_FLAG != 0 {
        let code = body.get(2).copied().unwrap_or(0);
        return Err(FrameError::DeviceException(code));
    }

    Ok(Frame {
        slave: body[0],
        function,
        payload: body[2..].to_vec(),
    })
}

/// CRC16 over `data`, polynomial 0xA001 (reversed), initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xa001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Standard meaning of a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        1 => "illegal function",
        2 => "illegal data address",
        3 => "illegal data value",
        4 => "slave device failure",
        5 => "acknowledge",
        6 => "slave device busy",
        7 => "negative acknowledge",
        8 => "memory parity error",
        10 => "gateway path unavailable",
        11 => "gateway target device failed to respond",
        _ => "non-standard failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_vector() {
        // Read one holding register from slave 1; a widely published example.
        let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&body), 0x0a84);
        assert_eq!(crc16(&body).to_le_bytes(), [0x84, 0x0a]);
    }

    #[test]
    fn test_request_encoding() {
        let raw = Frame::request(0x01, function::READ_HOLDING_REGISTERS, 0, 1).encode();
        assert_eq!(raw, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0a]);
    }

    #[test]
    fn test_round_trip() {
        let frame = Frame::new(0x11, function::READ_COILS, vec![0x01, 0xcd]);
        let decoded = decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_any_single_byte_corruption_detected() {
        let raw = Frame::new(0x02, function::WRITE_SINGLE_COIL, vec![0x00, 0x03, 0xff, 0x00])
            .encode();
        for i in 0..raw.len() {
            let mut corrupted = raw.clone();
            corrupted[i] ^= 0x40;
            assert!(
                matches!(decode(&corrupted), Err(FrameError::CrcMismatch { .. })),
                "corruption at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(decode(&[]), Err(FrameError::Truncated(0))));
        assert!(matches!(
            decode(&[0x01, 0x03, 0x84]),
            Err(FrameError::Truncated(3))
        ));
    }

    #[test]
    fn test_exception_reply() {
        let raw = Frame::new(0x01, 0x83, vec![0x02]).encode();
        match decode(&raw) {
            Err(FrameError::DeviceException(code)) => assert_eq!(code, 2),
            other => panic!("expected device exception, got {:?}", other),
        }
    }

    #[test]
    fn test_exception_description() {
        let err = FrameError::DeviceException(11);
        assert!(err
            .to_string()
            .contains("gateway target device failed to respond"));
    }
}
