//! Shared harness: a full bridge over a mock link and an in-memory bus
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use edgebridge::bus::{MemoryBus, Published, Topics};
use edgebridge::core::command::{Command, Operation};
use edgebridge::core::transport::MockTransport;
use edgebridge::{Bridge, BridgeConfig};
use serde_json::{json, Value};

pub const DEVICE: &str = "inverter-001";

pub struct Harness {
    pub bridge: Bridge,
    pub mock: MockTransport,
    pub bus: MemoryBus,
    pub topics: Topics,
}

/// Quiet configuration: no polling, health ticks far apart, short retry delay
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.polling.blocks.clear();
    config.health.check_interval = Duration::from_secs(3600);
    config.modbus.retry_delay = Duration::from_millis(100);
    config
}

pub fn start(config: BridgeConfig, mock: MockTransport) -> Harness {
    let (bus, events) = MemoryBus::new();
    let topics = Topics::new(&config.mqtt.topic_prefix, &config.device.id);
    let bridge = Bridge::assemble(&config, Box::new(mock.clone()), Arc::new(bus.clone()), events);
    Harness {
        bridge,
        mock,
        bus,
        topics,
    }
}

impl Harness {
    pub fn send_command(&self, payload: Value) {
        self.bus.inject_json(&self.topics.commands, &payload);
    }

    pub fn send_cancel(&self, command_id: &str) {
        self.bus
            .inject_json(&self.topics.cancel, &json!({ "commandId": command_id }));
    }

    pub async fn responses(&self, count: usize) -> Vec<Value> {
        self.bus
            .wait_for(&self.topics.command_response, count)
            .await
            .iter()
            .map(Published::json)
            .collect()
    }

    pub async fn alerts(&self, count: usize) -> Vec<Value> {
        self.bus
            .wait_for(&self.topics.alerts, count)
            .await
            .iter()
            .map(Published::json)
            .collect()
    }

    /// Enqueue a command behind the gateway's back and wait until it is on the wire
    pub async fn occupy_link(&self, id: &str) {
        let queue = self.bridge.queue();
        queue
            .enqueue(Command::new(
                id,
                DEVICE,
                Operation::ReadHoldingRegisters {
                    address: 1,
                    count: 1,
                },
            ))
            .unwrap();
        while queue.stats().executing.as_deref() != Some(id) {
            tokio::task::yield_now().await;
        }
    }
}

pub fn read_command(id: &str, address: u16) -> Value {
    json!({
        "commandId": id,
        "deviceId": DEVICE,
        "operation": "read_holding_registers",
        "address": address,
        "count": 1,
    })
}
