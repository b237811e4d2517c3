//! Modbus RTU frame handling
//!
//! An RTU application data unit is `slave address + PDU + CRC-16`, with the
//! CRC transmitted little-endian.

use std::time::Duration;

/// Largest RTU ADU allowed on the wire
pub const MAX_ADU_SIZE: usize = 256;

/// Minimum RTU frame: address + function + CRC
pub const MIN_ADU_SIZE: usize = 4;

const CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// A request addressed to one slave, before framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuRequest {
    pub slave_id: u8,
    pub pdu: Vec<u8>,
}

impl RtuRequest {
    pub fn new(slave_id: u8, pdu: Vec<u8>) -> Self {
        Self { slave_id, pdu }
    }

    /// Function code of the request
    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or(0)
    }
}

/// RTU frame structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub slave_address: u8,
    pub pdu: Vec<u8>,
    pub crc: u16,
}

/// Why a received byte sequence is not a valid RTU frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDefect {
    TooShort(usize),
    CrcMismatch { expected: u16, received: u16 },
}

impl std::fmt::Display for FrameDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "frame too short ({} bytes)", len),
            Self::CrcMismatch { expected, received } => write!(
                f,
                "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
                expected, received
            ),
        }
    }
}

impl RtuFrame {
    pub fn new(slave_address: u8, pdu: Vec<u8>) -> Self {
        let mut crc_input = Vec::with_capacity(pdu.len() + 1);
        crc_input.push(slave_address);
        crc_input.extend_from_slice(&pdu);
        let crc = calculate_crc(&crc_input);
        Self {
            slave_address,
            pdu,
            crc,
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.pdu.len() + 3);
        bytes.push(self.slave_address);
        bytes.extend_from_slice(&self.pdu);
        bytes.extend_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    /// Parse and CRC-check wire bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameDefect> {
        if data.len() < MIN_ADU_SIZE {
            return Err(FrameDefect::TooShort(data.len()));
        }

        let pdu_end = data.len() - 2;
        let received = u16::from_le_bytes([data[pdu_end], data[pdu_end + 1]]);
        let expected = calculate_crc(&data[..pdu_end]);
        if received != expected {
            return Err(FrameDefect::CrcMismatch { expected, received });
        }

        Ok(Self {
            slave_address: data[0],
            pdu: data[1..pdu_end].to_vec(),
            crc: received,
        })
    }
}

impl From<&RtuRequest> for RtuFrame {
    fn from(request: &RtuRequest) -> Self {
        RtuFrame::new(request.slave_id, request.pdu.clone())
    }
}

/// CRC-16/MODBUS (init 0xFFFF, reflected polynomial 0xA001)
pub fn calculate_crc(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        let index = ((crc ^ u16::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC_TABLE[index];
    }
    crc
}

/// Expected total length of the response frame at the head of `buffer`
///
/// Returns `None` until enough header bytes have arrived to decide.
pub fn expected_response_length(buffer: &[u8]) -> Option<usize> {
    let function_code = *buffer.get(1)?;

    if function_code & 0x80 != 0 {
        // address + function + exception code + CRC
        return Some(5);
    }

    match function_code {
        0x01..=0x04 => {
            let byte_count = *buffer.get(2)? as usize;
            Some(3 + byte_count + 2)
        },
        // echo of address + quantity/value
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        _ => Some(8),
    }
}

/// 3.5 character silent interval between frames
///
/// One character is 11 bits on the wire. Above 19200 baud the interval is
/// fixed at 1750 µs.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::from_millis(4);
    }
    if baud_rate > 19200 {
        return Duration::from_micros(1750);
    }
    let char_time_us = (11 * 1_000_000) / u64::from(baud_rate);
    Duration::from_micros(char_time_us * 35 / 10)
}

/// Render bytes as spaced uppercase hex for logging
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
