//! Bridge gateway
//!
//! The only component that knows about topics and payloads. It parses
//! inbound bus messages into [`Inbound`] variants, turns commands into queue
//! work and publishes:
//! - one command response per admitted command, when it reaches a terminal
//!   state, plus a synthetic FAILED response for malformed commands
//! - telemetry from the poller
//! - status on every health transition, on connect and on each heartbeat
//! - alerts on entering and leaving OFFLINE and on device exceptions

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::messages::{
    AlertMessage, AlertType, CancelAck, CancelRequest, CommandRequest, CommandResponse,
    MessageError, Severity, StatusMessage, TelemetryMessage,
};
use crate::bus::{BusEvent, InboundMessage, MessageBus, Topics};
use crate::core::command::{Command, CommandResult, Origin, TelemetryReading};
use crate::core::health::{HealthHandle, HealthState, HealthTransition};
use crate::core::poller::PollEvent;
use crate::core::queue::{CancelError, CommandQueue};

/// Device id accepted on the broadcast topic by every bridge
pub const BROADCAST_DEVICE: &str = "*";

/// Publication counters for `/status`
#[derive(Debug, Default)]
pub struct GatewayStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    responses: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub responses: u64,
    pub malformed: u64,
    pub rejected: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Serializes payloads and publishes them on the device's topics
#[derive(Debug, Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    topics: Topics,
    device_id: String,
    device_type: String,
    stats: Arc<GatewayStats>,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topics: Topics,
        device_id: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            topics,
            device_id: device_id.into(),
            device_type: device_type.into(),
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Publish failures are logged and counted, never propagated
    async fn send<T: Serialize>(&self, topic: &str, payload: &T, retain: bool) -> bool {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode payload for {}: {}", topic, e);
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            },
        };
        match self.bus.publish(topic, bytes, retain).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(e) => {
                error!("Publish failed: {}", e);
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                false
            },
        }
    }

    pub async fn command_response(&self, response: &CommandResponse) {
        self.stats.responses.fetch_add(1, Ordering::Relaxed);
        if !self.send(&self.topics.command_response, response, false).await {
            error!(
                command_id = %response.command_id,
                "Command response could not be delivered"
            );
        }
    }

    pub async fn telemetry(&self, reading: &TelemetryReading) {
        self.send(&self.topics.data, &TelemetryMessage::from(reading), false)
            .await;
    }

    pub async fn status(&self, state: &HealthState) {
        let message = StatusMessage::from_state(&self.device_id, &self.device_type, state);
        self.send(&self.topics.status, &message, true).await;
    }

    /// Retained offline status for a clean shutdown
    pub async fn offline_status(&self) {
        let message = StatusMessage::last_will(&self.device_id, &self.device_type);
        self.send(&self.topics.status, &message, true).await;
    }

    pub async fn alert(&self, alert: &AlertMessage) {
        self.send(&self.topics.alerts, alert, false).await;
    }

    pub async fn cancel_ack(&self, ack: &CancelAck) {
        self.send(&self.topics.cancel_response, ack, false).await;
    }
}

/// Inbound message, classified by topic and parsed
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(CommandRequest),
    Cancel(CancelRequest),
}

/// Why an inbound message produced no work
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRejection {
    /// Addressed to another device on the broadcast topic
    NotForUs,
    /// Not a topic the gateway handles
    UnknownTopic,
    Malformed(MessageError),
}

/// Defaults applied to inbound commands
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub device_id: String,
    pub command_timeout: Duration,
    pub max_retries: u32,
}

/// Event sources the gateway reacts to
#[derive(Debug)]
pub struct GatewayInputs {
    pub bus: mpsc::UnboundedReceiver<BusEvent>,
    pub poll: mpsc::UnboundedReceiver<PollEvent>,
    pub transitions: mpsc::UnboundedReceiver<HealthTransition>,
    pub heartbeats: mpsc::UnboundedReceiver<HealthState>,
}

#[derive(Debug)]
pub struct BridgeGateway {
    settings: GatewaySettings,
    publisher: Publisher,
    queue: Arc<CommandQueue>,
    health: HealthHandle,
    responders: JoinSet<()>,
}

impl BridgeGateway {
    pub fn new(
        settings: GatewaySettings,
        publisher: Publisher,
        queue: Arc<CommandQueue>,
        health: HealthHandle,
    ) -> Self {
        Self {
            settings,
            publisher,
            queue,
            health,
            responders: JoinSet::new(),
        }
    }

    /// Classify and parse an inbound message
    pub fn parse(&self, message: &InboundMessage) -> Result<Inbound, InboundRejection> {
        let topics = self.publisher.topics();
        if message.topic == topics.cancel {
            return CancelRequest::parse(&message.payload)
                .map(Inbound::Cancel)
                .map_err(InboundRejection::Malformed);
        }

        let broadcast = message.topic == topics.broadcast_commands;
        if !broadcast && message.topic != topics.commands {
            return Err(InboundRejection::UnknownTopic);
        }

        let request =
            CommandRequest::parse(&message.payload).map_err(InboundRejection::Malformed)?;
        let ours = request.device_id == self.settings.device_id;
        if broadcast && !ours && request.device_id != BROADCAST_DEVICE {
            return Err(InboundRejection::NotForUs);
        }
        if !broadcast && !ours {
            return Err(InboundRejection::Malformed(MessageError {
                command_id: Some(request.command_id),
                reason: format!(
                    "deviceId {} does not match {}",
                    request.device_id, self.settings.device_id
                ),
            }));
        }
        Ok(Inbound::Command(request))
    }

    pub async fn handle_message(&mut self, message: InboundMessage) {
        match self.parse(&message) {
            Ok(Inbound::Command(request)) => self.submit(request).await,
            Ok(Inbound::Cancel(request)) => self.cancel(request).await,
            Err(InboundRejection::Malformed(err)) => self.reject_malformed(&message, err).await,
            Err(InboundRejection::NotForUs) => {
                debug!("Broadcast command for another device ignored")
            },
            Err(InboundRejection::UnknownTopic) => {
                debug!("No handler for topic {}", message.topic)
            },
        }
    }

    async fn reject_malformed(&self, message: &InboundMessage, err: MessageError) {
        self.publisher.stats.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(topic = %message.topic, "Malformed message: {}", err);
        match &err.command_id {
            // cancel requests are answered with a negative ack instead
            Some(id) if message.topic != self.publisher.topics().cancel => {
                let response = CommandResponse::rejected(id, &self.settings.device_id, &err.reason);
                self.publisher.command_response(&response).await;
            },
            _ => {
                let alert = AlertMessage::new(
                    &self.settings.device_id,
                    AlertType::MalformedCommand,
                    Severity::Warning,
                    format!("Malformed message on {}: {}", message.topic, err.reason),
                );
                self.publisher.alert(&alert).await;
            },
        }
    }

    async fn submit(&mut self, request: CommandRequest) {
        let command = Command::new(
            request.command_id,
            self.settings.device_id.clone(),
            request.operation,
        )
        .with_priority(request.priority)
        .with_timeout(request.timeout.unwrap_or(self.settings.command_timeout))
        .with_max_retries(request.max_retries.unwrap_or(self.settings.max_retries))
        .with_origin(Origin::External);
        let command_id = command.id.clone();

        match self.queue.enqueue(command) {
            Ok(ticket) => {
                let publisher = self.publisher.clone();
                let device_id = self.settings.device_id.clone();
                self.responders.spawn(async move {
                    let result = ticket.wait().await;
                    respond(&publisher, &device_id, &result).await;
                });
            },
            Err(e) => {
                // admission failures get no command response
                self.publisher.stats.rejected.fetch_add(1, Ordering::Relaxed);
                let alert = AlertMessage::new(
                    &self.settings.device_id,
                    AlertType::CommandRejected,
                    Severity::Warning,
                    format!("Command {} rejected: {}", command_id, e),
                )
                .for_command(command_id);
                self.publisher.alert(&alert).await;
            },
        }
    }

    async fn cancel(&self, request: CancelRequest) {
        let outcome = self.queue.cancel(&request.command_id);
        let ack = CancelAck {
            accepted: outcome.is_ok(),
            reason: outcome.as_ref().err().map(CancelError::to_string),
            command_id: request.command_id,
            timestamp: chrono::Utc::now(),
        };
        match &outcome {
            Ok(()) => info!(command_id = %ack.command_id, "Cancel accepted"),
            Err(e) => info!(command_id = %ack.command_id, "Cancel refused: {}", e),
        }
        self.publisher.cancel_ack(&ack).await;
    }

    pub async fn handle_poll(&self, event: PollEvent) {
        match event {
            PollEvent::Reading(reading) => self.publisher.telemetry(&reading).await,
            PollEvent::BlockFailed { block, result } => {
                if let Some(exception) = result.exception {
                    let alert = AlertMessage::new(
                        &self.settings.device_id,
                        AlertType::DeviceException,
                        Severity::Warning,
                        format!("Poll block {} rejected by device: {}", block, exception),
                    )
                    .for_command(result.command_id);
                    self.publisher.alert(&alert).await;
                }
            },
        }
    }

    pub async fn handle_transition(&self, transition: HealthTransition) {
        self.publisher.status(&transition.state).await;

        if transition.entered_offline() {
            let alert = AlertMessage::new(
                &self.settings.device_id,
                AlertType::LinkOffline,
                Severity::Critical,
                format!(
                    "Link offline after {} consecutive failures: {}",
                    transition.state.consecutive_failures,
                    transition.state.last_error.as_deref().unwrap_or("unknown error")
                ),
            );
            self.publisher.alert(&alert).await;
        } else if transition.left_offline() {
            let alert = AlertMessage::new(
                &self.settings.device_id,
                AlertType::LinkRecovered,
                Severity::Info,
                "Link recovered",
            );
            self.publisher.alert(&alert).await;
        }
    }

    /// Event loop until shutdown; then waits for outstanding responses
    pub async fn run(mut self, mut inputs: GatewayInputs, shutdown: CancellationToken) {
        info!("Bridge gateway started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(transition) = inputs.transitions.recv() => {
                    self.handle_transition(transition).await;
                },
                Some(event) = inputs.bus.recv() => match event {
                    BusEvent::Connected => {
                        self.publisher.status(&self.health.snapshot()).await;
                    },
                    BusEvent::Message(message) => self.handle_message(message).await,
                },
                Some(event) = inputs.poll.recv() => self.handle_poll(event).await,
                Some(state) = inputs.heartbeats.recv() => self.publisher.status(&state).await,
                Some(joined) = self.responders.join_next(), if !self.responders.is_empty() => {
                    if let Err(e) = joined {
                        error!("Response task failed: {}", e);
                    }
                },
            }
        }

        // pending commands are cancelled by the drain loop; their responses
        // still go out before the final offline status
        while let Some(joined) = self.responders.join_next().await {
            if let Err(e) = joined {
                error!("Response task failed: {}", e);
            }
        }
        while let Ok(transition) = inputs.transitions.try_recv() {
            self.handle_transition(transition).await;
        }
        while let Ok(event) = inputs.poll.try_recv() {
            self.handle_poll(event).await;
        }
        self.publisher.offline_status().await;
        info!("Bridge gateway stopped");
    }
}

async fn respond(publisher: &Publisher, device_id: &str, result: &CommandResult) {
    if let Some(exception) = result.exception {
        let alert = AlertMessage::new(
            device_id,
            AlertType::DeviceException,
            Severity::Warning,
            format!("Command {} rejected by device: {}", result.command_id, exception),
        )
        .for_command(result.command_id.clone());
        publisher.alert(&alert).await;
    }
    publisher
        .command_response(&CommandResponse::from_result(device_id, result))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::core::health::HealthMonitor;
    use serde_json::json;

    fn gateway() -> (BridgeGateway, MemoryBus, Arc<CommandQueue>, HealthMonitor) {
        let (bus, _events) = MemoryBus::new();
        let (monitor, _rx) = HealthMonitor::new(3);
        let queue = Arc::new(CommandQueue::new(10, 100, monitor.handle()));
        let publisher = Publisher::new(
            Arc::new(bus.clone()),
            Topics::new("nattery", "inverter-001"),
            "inverter-001",
            "inverter",
        );
        let gateway = BridgeGateway::new(
            GatewaySettings {
                device_id: "inverter-001".to_string(),
                command_timeout: Duration::from_secs(10),
                max_retries: 3,
            },
            publisher,
            Arc::clone(&queue),
            monitor.handle(),
        );
        (gateway, bus, queue, monitor)
    }

    fn message(topic: &str, payload: serde_json::Value) -> InboundMessage {
        InboundMessage::new(topic, payload.to_string())
    }

    #[tokio::test]
    async fn broadcast_filters_by_device() {
        let (gateway, _bus, _queue, _monitor) = gateway();
        let other = message(
            "nattery/broadcast/commands",
            json!({"commandId": "b1", "deviceId": "inverter-002", "operation": "read_coils", "address": 0}),
        );
        assert_eq!(gateway.parse(&other), Err(InboundRejection::NotForUs));

        let everyone = message(
            "nattery/broadcast/commands",
            json!({"commandId": "b2", "deviceId": "*", "operation": "read_coils", "address": 0}),
        );
        assert!(matches!(gateway.parse(&everyone), Ok(Inbound::Command(_))));

        let stray = message("nattery/inverter-001/whatever", json!({}));
        assert_eq!(gateway.parse(&stray), Err(InboundRejection::UnknownTopic));
    }

    #[tokio::test]
    async fn malformed_command_gets_synthetic_failed_response() {
        let (mut gateway, bus, queue, _monitor) = gateway();
        gateway
            .handle_message(message(
                "nattery/inverter-001/commands",
                json!({"commandId": "bad-1", "deviceId": "inverter-001", "operation": "explode", "address": 1}),
            ))
            .await;

        let responses = bus.published_on("nattery/inverter-001/commands/response");
        assert_eq!(responses.len(), 1);
        let body = responses[0].json();
        assert_eq!(body["commandId"], "bad-1");
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("unknown operation"));
        assert_eq!(queue.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn wrong_device_on_own_topic_is_malformed() {
        let (mut gateway, bus, queue, _monitor) = gateway();
        gateway
            .handle_message(message(
                "nattery/inverter-001/commands",
                json!({"commandId": "x", "deviceId": "inverter-777", "operation": "read_coils", "address": 1}),
            ))
            .await;
        let responses = bus.published_on("nattery/inverter-001/commands/response");
        assert_eq!(responses[0].json()["commandId"], "x");
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn unparseable_payload_raises_alert_instead() {
        let (mut gateway, bus, _queue, _monitor) = gateway();
        gateway
            .handle_message(InboundMessage::new("nattery/inverter-001/commands", "not json"))
            .await;
        assert!(bus
            .published_on("nattery/inverter-001/commands/response")
            .is_empty());
        let alerts = bus.published_on("nattery/inverter-001/alerts");
        assert_eq!(alerts[0].json()["alertType"], "malformed_command");
    }

    #[tokio::test]
    async fn applies_command_defaults() {
        let (mut gateway, _bus, queue, _monitor) = gateway();
        gateway
            .handle_message(message(
                "nattery/inverter-001/commands",
                json!({"commandId": "c1", "deviceId": "inverter-001", "operation": "read_holding_registers", "address": 3021, "count": 2}),
            ))
            .await;
        let dispatch = queue.next().await.unwrap();
        assert_eq!(dispatch.command.timeout, Duration::from_secs(10));
        assert_eq!(dispatch.command.max_retries, 3);
        assert_eq!(dispatch.command.origin, Origin::External);
    }

    #[tokio::test]
    async fn cancel_is_acknowledged() {
        let (mut gateway, bus, queue, _monitor) = gateway();
        gateway
            .handle_message(message(
                "nattery/inverter-001/commands",
                json!({"commandId": "c1", "deviceId": "inverter-001", "operation": "read_coils", "address": 1}),
            ))
            .await;
        gateway
            .handle_message(message(
                "nattery/inverter-001/commands/cancel",
                json!({"commandId": "c1"}),
            ))
            .await;
        gateway
            .handle_message(message(
                "nattery/inverter-001/commands/cancel",
                json!({"commandId": "ghost"}),
            ))
            .await;

        let acks = bus.published_on("nattery/inverter-001/commands/cancel/response");
        assert_eq!(acks[0].json()["accepted"], true);
        assert_eq!(acks[1].json()["accepted"], false);
        assert!(acks[1].json()["reason"].as_str().unwrap().contains("not found"));
        assert_eq!(queue.depth(), 0);

        // the cancelled command still gets its one response
        let responses = bus
            .wait_for("nattery/inverter-001/commands/response", 1)
            .await;
        assert_eq!(responses[0].json()["commandId"], "c1");
        assert_eq!(responses[0].json()["error"], "cancelled");
    }

    #[tokio::test]
    async fn offline_transition_publishes_status_and_one_alert() {
        let (gateway, bus, _queue, monitor) = gateway();
        let (tx_monitor, mut transitions) = HealthMonitor::new(1);
        drop(monitor);
        tx_monitor.record_failure("timeout");
        gateway
            .handle_transition(transitions.try_recv().unwrap())
            .await;

        let status = bus.published_on("nattery/inverter-001/status");
        assert_eq!(status.len(), 1);
        assert!(status[0].retain);
        assert_eq!(status[0].json()["status"], "OFFLINE");
        let alerts = bus.published_on("nattery/inverter-001/alerts");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].json()["severity"], "critical");
    }

    #[tokio::test]
    async fn late_transition_published_before_final_status() {
        let (gateway, bus, _queue, _monitor) = gateway();
        let (monitor, transitions) = HealthMonitor::new(1);
        let (_bus_tx, bus_rx) = mpsc::unbounded_channel();
        let (_poll_tx, poll) = mpsc::unbounded_channel();
        let (_heartbeat_tx, heartbeats) = mpsc::unbounded_channel();
        let inputs = GatewayInputs {
            bus: bus_rx,
            poll,
            transitions,
            heartbeats,
        };

        // the last command failed just as shutdown began
        monitor.record_failure("timeout");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        gateway.run(inputs, shutdown).await;

        let alerts = bus.published_on("nattery/inverter-001/alerts");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].json()["alertType"], "link_offline");

        let status = bus.published_on("nattery/inverter-001/status");
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].json()["status"], "OFFLINE");
        assert_eq!(status[0].json()["consecutiveFailures"], 1);
        assert_eq!(status[1].json()["online"], false);
    }

    #[tokio::test]
    async fn publish_failures_are_counted_not_fatal() {
        let (gateway, bus, _queue, _monitor) = gateway();
        bus.fail_publishes(true);
        gateway.publisher.status(&HealthState::default()).await;
        let stats = gateway.publisher.stats().snapshot();
        assert_eq!(stats.publish_failures, 1);
        assert_eq!(stats.published, 0);
    }
}
