//! Periodic health check
//!
//! Every `check_interval` the current [`HealthState`] is sent out as a
//! heartbeat. While the link is OFFLINE a single-register recovery probe is
//! enqueued as well: ordinary work is refused in that state, so the probe is
//! what produces the success that brings the link back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::command::{Command, Operation, Origin, Priority};
use crate::core::health::{HealthHandle, HealthState};
use crate::core::queue::CommandQueue;

#[derive(Debug, Clone)]
pub struct HealthCheckSettings {
    pub device_id: String,
    pub interval: Duration,
    /// Single-register read used to probe an offline link
    pub probe: Operation,
    pub probe_timeout: Duration,
}

#[derive(Debug)]
pub struct HealthChecker {
    settings: HealthCheckSettings,
    health: HealthHandle,
    queue: Arc<CommandQueue>,
    heartbeats: mpsc::UnboundedSender<HealthState>,
    probes: u64,
}

impl HealthChecker {
    pub fn new(
        settings: HealthCheckSettings,
        health: HealthHandle,
        queue: Arc<CommandQueue>,
        heartbeats: mpsc::UnboundedSender<HealthState>,
    ) -> Self {
        Self {
            settings,
            health,
            queue,
            heartbeats,
            probes: 0,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately; the connect status covers it
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check(),
            }
        }
        debug!("Health check loop stopped");
    }

    fn check(&mut self) {
        let state = self.health.snapshot();
        if self.health.is_offline() {
            self.probe();
        }
        let _ = self.heartbeats.send(state);
    }

    fn probe(&mut self) {
        self.probes += 1;
        let command = Command::new(
            format!("probe-{}", self.probes),
            self.settings.device_id.clone(),
            self.settings.probe.clone(),
        )
        .with_origin(Origin::Probe)
        .with_priority(Priority::Low)
        .with_timeout(self.settings.probe_timeout)
        .with_max_retries(1);

        match self.queue.enqueue(command) {
            Ok(ticket) => {
                info!(command_id = %ticket.command_id, "Recovery probe queued");
                tokio::spawn(async move {
                    let result = ticket.wait().await;
                    debug!(
                        command_id = %result.command_id,
                        "Recovery probe finished: {}",
                        result.state
                    );
                });
            },
            Err(e) => debug!("Recovery probe not queued: {}", e),
        }
    }
}
