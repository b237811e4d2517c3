//! Modbus PDU encoding and decoding
//!
//! Requests are built from an [`Operation`]; responses are checked against
//! the operation that produced them and turned into a [`CommandOutput`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::core::command::{CommandOutput, Operation};

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Device-reported exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Unknown(code) => code,
        }
    }

    /// Busy/acknowledge/gateway codes mean "try again later"; the rest are
    /// request errors that a retry cannot fix.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Acknowledge
                | Self::ServerDeviceBusy
                | Self::GatewayPathUnavailable
                | Self::GatewayTargetFailedToRespond
        )
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetFailedToRespond => "gateway target failed to respond",
            Self::Unknown(_) => "unknown exception",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

/// Response PDU does not match the request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PduError {
    #[error("response truncated: {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("unexpected byte count {actual}, expected {expected}")]
    ByteCount { expected: usize, actual: usize },

    #[error("write echo mismatch for function 0x{function:02X}")]
    EchoMismatch { function: u8 },
}

/// Build the request PDU for an operation
pub fn encode_request(operation: &Operation) -> Vec<u8> {
    let fc = operation.function_code();
    let mut pdu = vec![fc];

    match operation {
        Operation::ReadCoils { address, count }
        | Operation::ReadDiscreteInputs { address, count }
        | Operation::ReadHoldingRegisters { address, count }
        | Operation::ReadInputRegisters { address, count } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&count.to_be_bytes());
        },
        Operation::WriteSingleCoil { address, value } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            let raw = if *value { COIL_ON } else { COIL_OFF };
            pdu.extend_from_slice(&raw.to_be_bytes());
        },
        Operation::WriteSingleRegister { address, value } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&value.to_be_bytes());
        },
        Operation::WriteMultipleCoils { address, values } => {
            let packed = pack_bits(values);
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
        },
        Operation::WriteMultipleRegisters { address, values } => {
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
            pdu.push((values.len() * 2) as u8);
            for value in values {
                pdu.extend_from_slice(&value.to_be_bytes());
            }
        },
    }

    pdu
}

/// Decode a response PDU (function code already verified by the transport)
pub fn decode_response(operation: &Operation, pdu: &[u8]) -> Result<CommandOutput, PduError> {
    match operation {
        Operation::ReadHoldingRegisters { address, count }
        | Operation::ReadInputRegisters { address, count } => {
            let expected = usize::from(*count) * 2;
            let data = read_payload(pdu, expected)?;
            let registers = data
                .chunks_exact(2)
                .enumerate()
                .map(|(i, chunk)| {
                    (
                        address.wrapping_add(i as u16),
                        u16::from_be_bytes([chunk[0], chunk[1]]),
                    )
                })
                .collect();
            Ok(CommandOutput::Registers { registers })
        },
        Operation::ReadCoils { address, count }
        | Operation::ReadDiscreteInputs { address, count } => {
            let expected = usize::from(*count).div_ceil(8);
            let data = read_payload(pdu, expected)?;
            let registers: BTreeMap<u16, u16> = (0..*count)
                .map(|i| {
                    let byte = data[usize::from(i / 8)];
                    let bit = (byte >> (i % 8)) & 0x01;
                    (address.wrapping_add(i), u16::from(bit))
                })
                .collect();
            Ok(CommandOutput::Registers { registers })
        },
        Operation::WriteSingleCoil { .. } | Operation::WriteSingleRegister { .. } => {
            let request = encode_request(operation);
            if pdu.len() < 5 {
                return Err(PduError::Truncated {
                    expected: 5,
                    actual: pdu.len(),
                });
            }
            if pdu[..5] != request[..5] {
                return Err(PduError::EchoMismatch {
                    function: operation.function_code(),
                });
            }
            let range = operation.address_range();
            Ok(CommandOutput::Written {
                address: range.start,
                count: range.count,
            })
        },
        Operation::WriteMultipleCoils { .. } | Operation::WriteMultipleRegisters { .. } => {
            if pdu.len() < 5 {
                return Err(PduError::Truncated {
                    expected: 5,
                    actual: pdu.len(),
                });
            }
            let range = operation.address_range();
            let echoed_address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let echoed_count = u16::from_be_bytes([pdu[3], pdu[4]]);
            if echoed_address != range.start || echoed_count != range.count {
                return Err(PduError::EchoMismatch {
                    function: operation.function_code(),
                });
            }
            Ok(CommandOutput::Written {
                address: range.start,
                count: range.count,
            })
        },
    }
}

fn read_payload(pdu: &[u8], expected: usize) -> Result<&[u8], PduError> {
    let byte_count = *pdu.get(1).ok_or(PduError::Truncated {
        expected: 2,
        actual: pdu.len(),
    })? as usize;
    if byte_count != expected {
        return Err(PduError::ByteCount {
            expected,
            actual: byte_count,
        });
    }
    pdu.get(2..2 + byte_count).ok_or(PduError::Truncated {
        expected: 2 + byte_count,
        actual: pdu.len(),
    })
}

fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, value) in values.iter().enumerate() {
        if *value {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}
