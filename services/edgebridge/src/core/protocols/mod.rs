//! Protocol implementations
//!
//! The bridge talks to a single device over Modbus RTU.

pub mod modbus;
