//! Bridge assembly and lifecycle
//!
//! [`Bridge::assemble`] wires the components around a transport and a bus:
//!
//! ```text
//! gateway ─┐                     ┌─> executor ─> transport
//! poller  ─┼─> command queue ────┤
//! probes  ─┘    (drain loop)     └─> health monitor ─> gateway alerts
//! ```
//!
//! The drain loop is the only task that touches the link. [`run`] is the
//! production entry: serial port, MQTT bus and HTTP server.

use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{create_router, AppState, DeviceInfo};
use crate::bus::messages::StatusMessage;
use crate::bus::{BusEvent, MessageBus, MqttBus, Topics};
use crate::core::command::{Operation, Priority};
use crate::core::config::BridgeConfig;
use crate::core::executor::TransactionExecutor;
use crate::core::health::{HealthHandle, HealthMonitor};
use crate::core::health_check::{HealthCheckSettings, HealthChecker};
use crate::core::poller::{PollerSettings, TelemetryPoller};
use crate::core::queue::{run_drain_loop, CommandQueue};
use crate::core::transport::{SerialTransport, Transport};
use crate::error::{BridgeError, Result};
use crate::gateway::{BridgeGateway, GatewayInputs, GatewaySettings, Publisher};

/// Single-register read used as the recovery probe
fn probe_operation(config: &BridgeConfig) -> Operation {
    match config.polling.blocks.first() {
        Some(block) => {
            let mut single = block.clone();
            single.count = 1;
            single.operation()
        },
        None => Operation::ReadHoldingRegisters {
            address: 0,
            count: 1,
        },
    }
}

/// A running bridge
#[derive(Debug)]
pub struct Bridge {
    queue: Arc<CommandQueue>,
    health: HealthHandle,
    state: AppState,
    bus: Arc<dyn MessageBus>,
    shutdown: CancellationToken,
    producers: Vec<(&'static str, JoinHandle<()>)>,
    drain: JoinHandle<()>,
    gateway: JoinHandle<()>,
}

impl Bridge {
    /// Spawn all bridge tasks
    ///
    /// The transport should already be open; the executor reopens it after
    /// link failures.
    pub fn assemble(
        config: &BridgeConfig,
        transport: Box<dyn Transport>,
        bus: Arc<dyn MessageBus>,
        bus_events: mpsc::UnboundedReceiver<BusEvent>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (monitor, transitions) = HealthMonitor::new(config.health.max_consecutive_failures);
        let health = monitor.handle();
        let queue = Arc::new(CommandQueue::new(
            config.queue.max_size,
            config.queue.history_size,
            health.clone(),
        ));

        let executor = TransactionExecutor::new(
            transport,
            monitor,
            config.retry_policy(),
            config.modbus.slave_id,
        );
        let drain = tokio::spawn(run_drain_loop(
            Arc::clone(&queue),
            executor,
            shutdown.clone(),
        ));

        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let poller = TelemetryPoller::new(
            PollerSettings {
                device_id: config.device.id.clone(),
                blocks: config.polling.blocks.clone(),
                interval: config.polling.interval,
                timeout: config.modbus.timeout,
                max_retries: config.modbus.retry_count,
                priority: Priority::Normal,
            },
            Arc::clone(&queue),
            poll_tx,
        );

        let (beat_tx, beat_rx) = mpsc::unbounded_channel();
        let checker = HealthChecker::new(
            HealthCheckSettings {
                device_id: config.device.id.clone(),
                interval: config.health.check_interval,
                probe: probe_operation(config),
                probe_timeout: config.modbus.timeout,
            },
            health.clone(),
            Arc::clone(&queue),
            beat_tx,
        );

        let publisher = Publisher::new(
            Arc::clone(&bus),
            Topics::new(&config.mqtt.topic_prefix, &config.device.id),
            config.device.id.clone(),
            config.device.device_type.clone(),
        );
        let gateway_stats = publisher.stats();
        let gateway = BridgeGateway::new(
            GatewaySettings {
                device_id: config.device.id.clone(),
                command_timeout: config.queue.command_timeout,
                max_retries: config.modbus.retry_count,
            },
            publisher,
            Arc::clone(&queue),
            health.clone(),
        );
        let gateway = tokio::spawn(gateway.run(
            GatewayInputs {
                bus: bus_events,
                poll: poll_rx,
                transitions,
                heartbeats: beat_rx,
            },
            shutdown.clone(),
        ));

        let producers = vec![
            ("poller", tokio::spawn(poller.run(shutdown.clone()))),
            ("health check", tokio::spawn(checker.run(shutdown.clone()))),
        ];

        let state = AppState {
            health: health.clone(),
            queue: Arc::clone(&queue),
            gateway: gateway_stats,
            device: Arc::new(DeviceInfo {
                device_id: config.device.id.clone(),
                device_type: config.device.device_type.clone(),
                model: config.device.model.clone(),
                serial_port: config.modbus.port.clone(),
                baud_rate: config.modbus.baud_rate,
                slave_id: config.modbus.slave_id,
            }),
            started_at: Utc::now(),
        };

        info!(
            "Bridge assembled for {} (slave {})",
            config.device.id, config.modbus.slave_id
        );

        Self {
            queue,
            health,
            state,
            bus,
            shutdown,
            producers,
            drain,
            gateway,
        }
    }

    pub fn queue(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.queue)
    }

    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    pub fn app_state(&self) -> AppState {
        self.state.clone()
    }

    /// Stop producers, let the executing command finish, cancel what is
    /// pending, flush responses and publish the final offline status
    pub async fn shutdown(self) {
        info!("Shutting down bridge");
        self.shutdown.cancel();

        for (name, handle) in self.producers {
            if let Err(e) = handle.await {
                error!("{} task failed: {}", name, e);
            }
        }
        if let Err(e) = self.drain.await {
            error!("Drain loop failed: {}", e);
        }
        if let Err(e) = self.gateway.await {
            error!("Gateway task failed: {}", e);
        }
        if let Err(e) = self.bus.close().await {
            error!("Closing message bus: {}", e);
        }
        info!("Bridge stopped");
    }
}

/// Production entry: open the serial link, connect the bus, serve the API
/// until a shutdown signal
pub async fn run(config: BridgeConfig, bind_address: String) -> Result<()> {
    let mut serial = SerialTransport::new(config.serial());
    // a port that cannot be opened at boot is fatal
    serial.connect().await?;

    let topics = Topics::new(&config.mqtt.topic_prefix, &config.device.id);
    let will = serde_json::to_vec(&StatusMessage::last_will(
        &config.device.id,
        &config.device.device_type,
    ))
    .map_err(|e| BridgeError::internal(format!("encode last will: {}", e)))?;
    let bus_shutdown = CancellationToken::new();
    let (bus, bus_events) = MqttBus::start(&config.mqtt, &topics, will, bus_shutdown.clone())?;

    let bridge = Bridge::assemble(&config, Box::new(serial), Arc::new(bus), bus_events);

    let listener = TcpListener::bind(&bind_address).await.map_err(|e| {
        BridgeError::internal(format!("Failed to bind {}: {}", bind_address, e))
    })?;
    info!("API listening on {}", bind_address);

    let app = create_router(bridge.app_state());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(common::shutdown::wait_for_shutdown())
        .await;
    if let Err(e) = served {
        error!("API server error: {}", e);
    }

    bridge.shutdown().await;
    bus_shutdown.cancel();
    Ok(())
}
