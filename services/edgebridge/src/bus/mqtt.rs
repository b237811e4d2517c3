//! MQTT bus over rumqttc
//!
//! The event loop runs in its own task. It re-subscribes on every ConnAck,
//! forwards publishes on subscribed topics to the gateway and, on connection
//! errors, waits a moment and lets rumqttc reconnect on the next poll. The
//! broker publishes the retained last-will status if the bridge vanishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusError, BusEvent, InboundMessage, MessageBus, Topics};
use crate::core::config::{parse_broker_url, MqttConfig};
use crate::error::{BridgeError, Result};

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Build client options, including the retained last will
pub fn mqtt_options(
    config: &MqttConfig,
    will_topic: &str,
    will_payload: Vec<u8>,
) -> Result<MqttOptions> {
    let (host, port) = parse_broker_url(&config.broker_url).ok_or_else(|| {
        BridgeError::config(format!("invalid broker url '{}'", config.broker_url))
    })?;

    let mut options = MqttOptions::new(&config.client_id, host, port);
    options.set_keep_alive(config.keepalive);
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }
    options.set_last_will(LastWill::new(
        will_topic,
        will_payload,
        qos(config.qos),
        true,
    ));
    Ok(options)
}

/// Message bus backed by an MQTT broker
#[derive(Debug, Clone)]
pub struct MqttBus {
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
}

impl MqttBus {
    /// Create the client and spawn its event loop
    pub fn start(
        config: &MqttConfig,
        topics: &Topics,
        will_payload: Vec<u8>,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BusEvent>)> {
        let options = mqtt_options(config, &topics.status, will_payload)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (events, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let subscriptions: Vec<String> = topics
            .subscriptions()
            .iter()
            .map(|t| t.to_string())
            .collect();
        tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            subscriptions,
            qos(config.qos),
            Arc::clone(&connected),
            events,
            shutdown,
        ));

        info!("MQTT client started for {}", config.broker_url);
        Ok((
            Self {
                client,
                qos: qos(config.qos),
                connected,
            },
            rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> std::result::Result<(), BusError> {
        self.client
            .publish(topic, self.qos, retain, payload)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Published to {}", topic);
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), BusError> {
        self.client
            .disconnect()
            .await
            .map_err(|_| BusError::NotConnected)
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    qos: QoS,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<BusEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                connected.store(true, Ordering::Relaxed);
                for topic in &subscriptions {
                    // try_ variant: this task is the one draining the request queue
                    if let Err(e) = client.try_subscribe(topic.as_str(), qos) {
                        error!("Subscribe to {} failed: {}", topic, e);
                    }
                }
                let _ = events.send(BusEvent::Connected);
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                if events.send(BusEvent::Message(message)).is_err() {
                    break;
                }
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("Subscription acknowledged: pkid {}", ack.pkid);
            },
            Ok(_) => {},
            Err(e) => {
                if connected.swap(false, Ordering::Relaxed) {
                    warn!("MQTT connection lost: {}", e);
                } else {
                    debug!("MQTT connection error: {}", e);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                }
            },
        }
    }

    connected.store(false, Ordering::Relaxed);
    debug!("MQTT event loop stopped");
}
