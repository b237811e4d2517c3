//! Edge Bridge
//!
//! Bridges one battery inverter on a Modbus RTU serial link to a
//! publish/subscribe message bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐   ┌───────────┐
//! │  MQTT / bus  │──►│ Bridge gateway │──►│ Command queue│──►│ Executor  │──► serial
//! └──────────────┘   └────────────────┘   └──────────────┘   └───────────┘
//!        ▲                   ▲                   ▲                 │
//!        │                   │            poller, probes           ▼
//!        └──── telemetry, status, alerts, responses ◄──── health monitor
//! ```
//!
//! - **`core`**: Modbus framing, transport, executor, queue, poller, health
//! - **`bus`**: message bus seam, MQTT and in-memory implementations, wire messages
//! - **`gateway`**: inbound parsing and outbound publishing
//! - **`api`**: read-only HTTP probes
//! - **`runtime`**: assembly and lifecycle

pub mod api;
pub mod bus;
pub mod core;
pub mod error;
pub mod gateway;
pub mod runtime;

pub use crate::core::config::BridgeConfig;
pub use crate::error::{BridgeError, Result};
pub use crate::runtime::Bridge;
