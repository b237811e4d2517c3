//! Telemetry poller
//!
//! On every tick one read per configured block is enqueued at NORMAL
//! priority. The tick's results are gathered in a separate task, so a slow
//! link never delays the timer. When the previous tick's reads are still
//! pending the queue refuses to stack new ones and the tick is skipped.
//! Missed ticks are never replayed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::command::{Command, CommandResult, Origin, Priority, TelemetryReading};
use crate::core::config::PollBlock;
use crate::core::queue::{CommandQueue, CommandTicket};

/// Outcome of a poll cycle, forwarded to the gateway
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// Every block was read
    Reading(TelemetryReading),
    /// One block failed; the cycle produced no telemetry
    BlockFailed { block: String, result: CommandResult },
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub device_id: String,
    pub blocks: Vec<PollBlock>,
    pub interval: Duration,
    /// Per-attempt timeout for poll reads
    pub timeout: Duration,
    pub max_retries: u32,
    pub priority: Priority,
}

/// Periodic generator of read commands
#[derive(Debug)]
pub struct TelemetryPoller {
    settings: PollerSettings,
    queue: Arc<CommandQueue>,
    events: mpsc::UnboundedSender<PollEvent>,
    cycle: u64,
}

impl TelemetryPoller {
    pub fn new(
        settings: PollerSettings,
        queue: Arc<CommandQueue>,
        events: mpsc::UnboundedSender<PollEvent>,
    ) -> Self {
        Self {
            settings,
            queue,
            events,
            cycle: 0,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.settings.blocks.is_empty() {
            info!("No poll blocks configured, telemetry poller idle");
            return;
        }
        info!(
            "Telemetry poller started: {} block(s) every {:?}",
            self.settings.blocks.len(),
            self.settings.interval
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(pending) = self.start_cycle() {
                        let events = self.events.clone();
                        let device_id = self.settings.device_id.clone();
                        tokio::spawn(collect_cycle(device_id, pending, events));
                    }
                },
            }
        }

        info!("Telemetry poller stopped");
    }

    /// Enqueue the reads for one tick
    ///
    /// Returns `None` when the tick is skipped. Reads already admitted in a
    /// skipped tick are withdrawn so they do not spend link time.
    fn start_cycle(&mut self) -> Option<Vec<(String, CommandTicket)>> {
        self.cycle += 1;
        let mut pending = Vec::with_capacity(self.settings.blocks.len());

        for block in &self.settings.blocks {
            let command = Command::new(
                format!("poll-{}-{}", block.name, self.cycle),
                self.settings.device_id.clone(),
                block.operation(),
            )
            .with_origin(Origin::Poller)
            .with_priority(self.settings.priority)
            .with_timeout(self.settings.timeout)
            .with_max_retries(self.settings.max_retries);

            match self.queue.enqueue(command) {
                Ok(ticket) => pending.push((block.name.clone(), ticket)),
                Err(e) => {
                    warn!(cycle = self.cycle, block = %block.name, "Poll tick skipped: {}", e);
                    self.withdraw(pending);
                    return None;
                },
            }
        }

        debug!(cycle = self.cycle, "Poll cycle queued");
        Some(pending)
    }

    fn withdraw(&self, admitted: Vec<(String, CommandTicket)>) {
        for (block, ticket) in admitted {
            // a read already on the wire finishes; its result is dropped
            if let Err(e) = self.queue.cancel(&ticket.command_id) {
                debug!(cycle = self.cycle, block = %block, "Poll read not withdrawn: {}", e);
            }
        }
    }
}

async fn collect_cycle(
    device_id: String,
    pending: Vec<(String, CommandTicket)>,
    events: mpsc::UnboundedSender<PollEvent>,
) {
    let (names, tickets): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
    let results = join_all(tickets.into_iter().map(CommandTicket::wait)).await;

    let mut registers = BTreeMap::new();
    let mut complete = true;
    for (block, result) in names.into_iter().zip(results) {
        match result.registers() {
            Some(values) if result.is_success() => registers.extend(values.iter()),
            _ => {
                complete = false;
                warn!(
                    block = %block,
                    command_id = %result.command_id,
                    "Poll read {}: {}",
                    result.state,
                    result.error.as_deref().unwrap_or("no data")
                );
                let _ = events.send(PollEvent::BlockFailed { block, result });
            },
        }
    }

    if complete {
        let _ = events.send(PollEvent::Reading(TelemetryReading {
            device_id,
            timestamp: Utc::now(),
            register_values: registers,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::CommandState;
    use crate::core::config::RegisterKind;
    use crate::core::executor::{RetryPolicy, TransactionExecutor};
    use crate::core::health::HealthMonitor;
    use crate::core::protocols::modbus::ExceptionCode;
    use crate::core::queue::run_drain_loop;
    use crate::core::transport::{MockReply, MockTransport, TransportError};
    use tracing_test::traced_test;

    fn settings(blocks: Vec<PollBlock>) -> PollerSettings {
        PollerSettings {
            device_id: "inverter-001".to_string(),
            blocks,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
            max_retries: 1,
            priority: Priority::Normal,
        }
    }

    fn block(name: &str, address: u16, count: u16) -> PollBlock {
        PollBlock {
            name: name.to_string(),
            kind: RegisterKind::Holding,
            address,
            count,
        }
    }

    struct Rig {
        mock: MockTransport,
        queue: Arc<CommandQueue>,
        shutdown: CancellationToken,
    }

    fn rig(mock: MockTransport) -> Rig {
        let (monitor, _rx) = HealthMonitor::new(5);
        let queue = Arc::new(CommandQueue::new(10, 100, monitor.handle()));
        let executor = TransactionExecutor::new(
            Box::new(mock.clone()),
            monitor,
            RetryPolicy::fixed(Duration::from_millis(100), Duration::from_secs(30)),
            1,
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(run_drain_loop(
            Arc::clone(&queue),
            executor,
            shutdown.clone(),
        ));
        Rig {
            mock,
            queue,
            shutdown,
        }
    }

    #[tokio::test]
    async fn partial_rejection_withdraws_admitted_reads() {
        let (monitor, _rx) = HealthMonitor::new(5);
        let queue = Arc::new(CommandQueue::new(1, 100, monitor.handle()));
        let (tx, _events) = mpsc::unbounded_channel();
        let mut poller = TelemetryPoller::new(
            settings(vec![block("status", 3021, 2), block("battery", 100, 1)]),
            Arc::clone(&queue),
            tx,
        );

        assert!(poller.start_cycle().is_none());
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.stats().rejected_full, 1);
        assert_eq!(
            queue.record("poll-status-1").unwrap().state,
            CommandState::Cancelled
        );
        assert!(queue.record("poll-battery-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_one_reading_per_cycle_with_all_blocks() {
        let rig = rig(MockTransport::new().with_default_reply(MockReply::Values(vec![7])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = TelemetryPoller::new(
            settings(vec![block("status", 3021, 2), block("battery", 100, 1)]),
            Arc::clone(&rig.queue),
            tx,
        );
        tokio::spawn(poller.run(rig.shutdown.clone()));

        let PollEvent::Reading(reading) = rx.recv().await.unwrap() else {
            panic!("expected a reading");
        };
        assert_eq!(reading.device_id, "inverter-001");
        let addresses: Vec<u16> = reading.register_values.keys().copied().collect();
        assert_eq!(addresses, vec![100, 3021, 3022]);
        assert!(reading.register_values.values().all(|v| *v == 7));

        // next cycle arrives one interval later
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, PollEvent::Reading(_)));
        assert_eq!(rig.mock.exchange_count(), 4);
        rig.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_block_suppresses_telemetry() {
        let mock = MockTransport::new();
        mock.push_reply(MockReply::Values(vec![1]));
        mock.push_reply(MockReply::Fail(TransportError::ProtocolException {
            function: 0x03,
            exception: ExceptionCode::IllegalDataAddress,
        }));
        let rig = rig(mock);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = TelemetryPoller::new(
            settings(vec![block("status", 3021, 1), block("bogus", 9000, 1)]),
            Arc::clone(&rig.queue),
            tx,
        );
        tokio::spawn(poller.run(rig.shutdown.clone()));

        let PollEvent::BlockFailed { block, result } = rx.recv().await.unwrap() else {
            panic!("expected a failure");
        };
        assert_eq!(block, "bogus");
        assert_eq!(result.state, CommandState::Failed);
        assert_eq!(result.exception, Some(ExceptionCode::IllegalDataAddress));
        rig.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn slow_link_skips_ticks_instead_of_stacking() {
        // each read takes 12s, longer than two poll intervals
        let mock = MockTransport::new().with_latency(Duration::from_secs(12));
        let rig = rig(mock);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut poller = TelemetryPoller::new(
            settings(vec![block("status", 3021, 1)]),
            Arc::clone(&rig.queue),
            tx,
        );

        assert!(poller.start_cycle().is_some());
        while rig.queue.depth() > 0 {
            tokio::task::yield_now().await;
        }
        // first read is executing, second is admitted behind it
        assert!(poller.start_cycle().is_some());
        // the second is still pending, so a third would stack
        assert!(poller.start_cycle().is_none());
        assert_eq!(rig.queue.depth(), 1);
        assert_eq!(rig.queue.stats().rejected_duplicate, 1);
        assert!(logs_contain("Poll tick skipped"));
        rig.shutdown.cancel();
    }
}
