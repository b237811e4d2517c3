//! Modbus RTU protocol support
//!
//! - `frame`: ADU framing, CRC-16 and response length prediction
//! - `pdu`: request encoding, response decoding and exception codes

pub mod frame;
pub mod pdu;

pub use frame::{calculate_crc, RtuFrame, RtuRequest};
pub use pdu::{decode_response, encode_request, ExceptionCode, PduError};
