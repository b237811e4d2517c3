//! Command queue
//!
//! The single place that decides what runs next on the wire. Pending
//! commands are ordered by priority (highest first) and then by enqueue
//! sequence. One drain loop takes the head, hands it to the executor and
//! waits for the terminal result before taking the next.
//!
//! `enqueue` and `cancel` never block: they take the internal lock, decide,
//! and return. The drain loop sleeps on a `Notify` while the queue is empty.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::command::{
    Command, CommandOutput, CommandResult, CommandState, Operation, Origin, Priority,
};
use crate::core::executor::TransactionExecutor;
use crate::core::health::HealthHandle;
use crate::core::protocols::modbus::ExceptionCode;

/// Admission failures, reported synchronously to the producer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("link offline, only EMERGENCY commands are admitted")]
    LinkOffline,

    #[error("duplicate command: {0}")]
    Duplicate(String),

    #[error("queue closed")]
    Closed,
}

/// Why a cancel request was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("command {0} not found")]
    NotFound(String),

    /// The command is already on the wire
    #[error("too late: command {0} is already executing")]
    TooLate(String),

    #[error("command {id} already finished as {state}")]
    AlreadyTerminal { id: String, state: CommandState },

    #[error("queue closed")]
    Closed,
}

/// Lifecycle record kept for `GET /commands/{id}`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: String,
    pub origin: Origin,
    pub priority: Priority,
    pub operation: Operation,
    pub state: CommandState,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionCode>,
}

/// Queue counters for `/status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub capacity: usize,
    pub executing: Option<String>,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub rejected_full: u64,
    pub rejected_offline: u64,
    pub rejected_duplicate: u64,
}

/// Handle to the eventual result of an admitted command
#[derive(Debug)]
pub struct CommandTicket {
    pub command_id: String,
    rx: oneshot::Receiver<CommandResult>,
}

impl CommandTicket {
    /// Wait for the terminal result
    pub async fn wait(self) -> CommandResult {
        let Self { command_id, rx } = self;
        match rx.await {
            Ok(result) => result,
            Err(_) => CommandResult::unsuccessful(
                command_id,
                CommandState::Failed,
                "command dropped before completion",
                0,
            ),
        }
    }
}

/// A command handed to the drain loop, with its reply slot
#[derive(Debug)]
pub struct Dispatch {
    pub command: Command,
    reply: oneshot::Sender<CommandResult>,
}

/// Execution order: higher priority first, then FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
}

#[derive(Debug)]
struct PendingEntry {
    command: Command,
    reply: oneshot::Sender<CommandResult>,
}

#[derive(Debug)]
struct CommandHistory {
    capacity: usize,
    order: VecDeque<String>,
    records: HashMap<String, CommandRecord>,
}

impl CommandHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            records: HashMap::new(),
        }
    }

    fn insert(&mut self, record: CommandRecord) {
        if self.capacity == 0 {
            return;
        }
        if !self.records.contains_key(&record.id) {
            self.order.push_back(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
        while self.order.len() > self.capacity {
            // Pending and executing records stay until they finish
            let finished = self.order.iter().position(|id| {
                self.records
                    .get(id)
                    .map_or(true, |record| record.state.is_terminal())
            });
            let Some(position) = finished else {
                break;
            };
            if let Some(oldest) = self.order.remove(position) {
                self.records.remove(&oldest);
            }
        }
    }

    fn update(&mut self, id: &str, apply: impl FnOnce(&mut CommandRecord)) {
        if let Some(record) = self.records.get_mut(id) {
            apply(record);
        }
    }

    fn get(&self, id: &str) -> Option<&CommandRecord> {
        self.records.get(id)
    }
}

#[derive(Debug)]
struct QueueState {
    pending: BTreeMap<QueueKey, PendingEntry>,
    index: HashMap<String, QueueKey>,
    executing: Option<String>,
    next_seq: u64,
    closed: bool,
    stats: QueueStats,
    history: CommandHistory,
}

/// Bounded, priority-ordered command queue
#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    health: HealthHandle,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CommandQueue {
    pub fn new(capacity: usize, history_size: usize, health: HealthHandle) -> Self {
        Self {
            capacity,
            health,
            state: Mutex::new(QueueState {
                pending: BTreeMap::new(),
                index: HashMap::new(),
                executing: None,
                next_seq: 0,
                closed: false,
                stats: QueueStats {
                    capacity,
                    ..Default::default()
                },
                history: CommandHistory::new(history_size),
            }),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a command or reject it immediately
    pub fn enqueue(&self, command: Command) -> Result<CommandTicket, QueueError> {
        let mut state = self.state.lock();

        let admission = self.admit(&state, &command);
        if let Err(e) = admission {
            match e {
                QueueError::QueueFull { .. } => state.stats.rejected_full += 1,
                QueueError::LinkOffline => state.stats.rejected_offline += 1,
                QueueError::Duplicate(_) => state.stats.rejected_duplicate += 1,
                QueueError::Closed => {},
            }
            drop(state);
            warn!(
                command_id = %command.id,
                origin = ?command.origin,
                priority = %command.priority,
                "Command rejected: {}",
                e
            );
            return Err(e);
        }

        let key = QueueKey {
            priority: Reverse(command.priority),
            seq: state.next_seq,
        };
        state.next_seq += 1;
        state.stats.enqueued += 1;

        state.history.insert(CommandRecord {
            id: command.id.clone(),
            origin: command.origin,
            priority: command.priority,
            operation: command.operation.clone(),
            state: CommandState::Pending,
            attempts: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            exception: None,
        });

        let (reply, rx) = oneshot::channel();
        let command_id = command.id.clone();
        debug!(
            command_id = %command_id,
            priority = %command.priority,
            depth = state.pending.len() + 1,
            "Command queued"
        );
        state.index.insert(command_id.clone(), key);
        state.pending.insert(key, PendingEntry { command, reply });
        drop(state);

        self.notify.notify_one();
        Ok(CommandTicket { command_id, rx })
    }

    fn admit(&self, state: &QueueState, command: &Command) -> Result<(), QueueError> {
        if state.closed {
            return Err(QueueError::Closed);
        }

        if state.index.contains_key(&command.id)
            || state.executing.as_deref() == Some(command.id.as_str())
        {
            return Err(QueueError::Duplicate(format!(
                "command id {} is already in flight",
                command.id
            )));
        }

        if self.health.is_offline()
            && command.priority < Priority::Emergency
            && command.origin != Origin::Probe
        {
            return Err(QueueError::LinkOffline);
        }

        if matches!(command.origin, Origin::Poller | Origin::Probe) {
            let stacked = state.pending.values().any(|entry| {
                matches!(entry.command.origin, Origin::Poller | Origin::Probe)
                    && entry.command.operation == command.operation
            });
            if stacked {
                return Err(QueueError::Duplicate(format!(
                    "{} at {} already pending",
                    command.operation.name(),
                    command.operation.address_range().start
                )));
            }
        }

        if state.pending.len() >= self.capacity {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }

        Ok(())
    }

    /// Take the head of the queue, waiting while it is empty
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<Dispatch> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some((_, entry)) = state.pending.pop_first() {
                    let id = entry.command.id.clone();
                    state.index.remove(&id);
                    state.executing = Some(id.clone());
                    state.history.update(&id, |record| {
                        record.state = CommandState::Executing;
                        record.started_at = Some(Utc::now());
                    });
                    return Some(Dispatch {
                        command: entry.command,
                        reply: entry.reply,
                    });
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Record the terminal result and deliver it to the producer
    pub fn finish(&self, dispatch: Dispatch, result: CommandResult) {
        {
            let mut state = self.state.lock();
            if state.executing.as_deref() == Some(dispatch.command.id.as_str()) {
                state.executing = None;
            }
            match result.state {
                CommandState::Completed => state.stats.completed += 1,
                CommandState::Failed => state.stats.failed += 1,
                CommandState::Timeout => state.stats.timed_out += 1,
                CommandState::Cancelled => state.stats.cancelled += 1,
                CommandState::Pending | CommandState::Executing => {},
            }
            state.history.update(&result.command_id, |record| {
                record.state = result.state;
                record.attempts = result.attempts;
                record.finished_at = Some(result.finished_at);
                record.result = result.output.clone();
                record.error = result.error.clone();
                record.exception = result.exception;
            });
        }

        if dispatch.reply.send(result).is_err() {
            debug!(
                command_id = %dispatch.command.id,
                "Result receiver dropped before delivery"
            );
        }
    }

    /// Cancel a pending command
    ///
    /// Racing with the drain loop is decided under the queue lock: either the
    /// command is still pending and ends CANCELLED, or it was already taken
    /// and the request is refused as too late.
    pub fn cancel(&self, command_id: &str) -> Result<(), CancelError> {
        let entry = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CancelError::Closed);
            }
            match state.index.remove(command_id) {
                Some(key) => {
                    let entry = state.pending.remove(&key);
                    state.stats.cancelled += 1;
                    let now = Utc::now();
                    state.history.update(command_id, |record| {
                        record.state = CommandState::Cancelled;
                        record.finished_at = Some(now);
                        record.error = Some("cancelled".to_string());
                    });
                    entry
                },
                None => {
                    if state.executing.as_deref() == Some(command_id) {
                        return Err(CancelError::TooLate(command_id.to_string()));
                    }
                    return match state.history.get(command_id) {
                        Some(record) if record.state.is_terminal() => {
                            Err(CancelError::AlreadyTerminal {
                                id: command_id.to_string(),
                                state: record.state,
                            })
                        },
                        _ => Err(CancelError::NotFound(command_id.to_string())),
                    };
                },
            }
        };

        if let Some(entry) = entry {
            info!(command_id, "Pending command cancelled");
            let _ = entry
                .reply
                .send(CommandResult::cancelled(command_id, "cancelled"));
        }
        Ok(())
    }

    /// Refuse new work and cancel everything still pending
    ///
    /// The executing command, if any, runs to completion.
    pub fn close(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            state.index.clear();
            let pending = std::mem::take(&mut state.pending);
            let now = Utc::now();
            for entry in pending.values() {
                state.history.update(&entry.command.id, |record| {
                    record.state = CommandState::Cancelled;
                    record.finished_at = Some(now);
                    record.error = Some("cancelled: bridge shutting down".to_string());
                });
            }
            state.stats.cancelled += pending.len() as u64;
            pending.into_values().collect()
        };

        let count = drained.len();
        for entry in drained {
            let result =
                CommandResult::cancelled(&entry.command.id, "cancelled: bridge shutting down");
            let _ = entry.reply.send(result);
        }
        self.notify.notify_one();

        if count > 0 {
            info!("Cancelled {} pending commands on shutdown", count);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            pending: state.pending.len(),
            executing: state.executing.clone(),
            ..state.stats.clone()
        }
    }

    /// Lifecycle record of a recent command
    pub fn record(&self, command_id: &str) -> Option<CommandRecord> {
        self.state.lock().history.get(command_id).cloned()
    }
}

/// The single consumer: drain the queue into the executor one command at a
/// time until shutdown
///
/// On shutdown the command in progress finishes, the remaining pending
/// commands are cancelled and the link is closed.
pub async fn run_drain_loop(
    queue: Arc<CommandQueue>,
    mut executor: TransactionExecutor,
    shutdown: CancellationToken,
) {
    info!("Command drain loop started");

    loop {
        let dispatch = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = queue.next() => match next {
                Some(dispatch) => dispatch,
                None => break,
            },
        };

        let result = executor.execute(&dispatch.command).await;
        queue.finish(dispatch, result);
    }

    queue.close();
    executor.shutdown().await;
    info!("Command drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::health::HealthMonitor;

    fn read(id: &str, address: u16) -> Command {
        Command::new(
            id,
            "inverter-001",
            Operation::ReadHoldingRegisters { address, count: 1 },
        )
    }

    fn queue(capacity: usize) -> (CommandQueue, HealthMonitor) {
        let (monitor, _rx) = HealthMonitor::new(1);
        let queue = CommandQueue::new(capacity, 100, monitor.handle());
        (queue, monitor)
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_fifo() {
        let (queue, _monitor) = queue(10);
        queue.enqueue(read("low-1", 1).with_priority(Priority::Low)).unwrap();
        queue.enqueue(read("normal", 2)).unwrap();
        queue
            .enqueue(read("emergency", 3).with_priority(Priority::Emergency))
            .unwrap();
        queue.enqueue(read("low-2", 4).with_priority(Priority::Low)).unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            let dispatch = queue.next().await.unwrap();
            order.push(dispatch.command.id.clone());
            let result = CommandResult::cancelled(&dispatch.command.id, "test");
            queue.finish(dispatch, result);
        }
        assert_eq!(order, vec!["emergency", "normal", "low-1", "low-2"]);
    }

    #[test]
    fn rejects_beyond_capacity() {
        let (queue, _monitor) = queue(2);
        queue.enqueue(read("a", 1)).unwrap();
        queue.enqueue(read("b", 2)).unwrap();
        assert_eq!(
            queue.enqueue(read("c", 3)).unwrap_err(),
            QueueError::QueueFull { capacity: 2 }
        );
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.stats().rejected_full, 1);
        assert!(queue.record("c").is_none());
    }

    #[test]
    fn offline_admits_only_emergency_and_probes() {
        let (queue, monitor) = queue(10);
        monitor.record_failure("timeout");

        assert_eq!(
            queue.enqueue(read("n", 1)).unwrap_err(),
            QueueError::LinkOffline
        );
        assert_eq!(
            queue
                .enqueue(read("c", 1).with_priority(Priority::Critical))
                .unwrap_err(),
            QueueError::LinkOffline
        );
        assert!(queue
            .enqueue(read("e", 1).with_priority(Priority::Emergency))
            .is_ok());
        assert!(queue
            .enqueue(read("p", 2).with_origin(Origin::Probe).with_priority(Priority::Low))
            .is_ok());
        assert_eq!(queue.stats().rejected_offline, 2);
    }

    #[test]
    fn poller_reads_are_not_stacked() {
        let (queue, _monitor) = queue(10);
        queue.enqueue(read("poll-1", 3021).with_origin(Origin::Poller)).unwrap();

        let stacked = queue.enqueue(read("poll-2", 3021).with_origin(Origin::Poller));
        assert!(matches!(stacked, Err(QueueError::Duplicate(_))));

        // a different block, or the same read from outside, is fine
        assert!(queue
            .enqueue(read("poll-3", 4000).with_origin(Origin::Poller))
            .is_ok());
        assert!(queue.enqueue(read("ext", 3021)).is_ok());
    }

    #[test]
    fn rejects_reused_pending_id() {
        let (queue, _monitor) = queue(10);
        queue.enqueue(read("same", 1)).unwrap();
        assert!(matches!(
            queue.enqueue(read("same", 2)),
            Err(QueueError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn cancel_pending_delivers_cancelled_result() {
        let (queue, _monitor) = queue(10);
        let ticket = queue.enqueue(read("c1", 1)).unwrap();

        queue.cancel("c1").unwrap();
        let result = ticket.wait().await;
        assert_eq!(result.state, CommandState::Cancelled);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.record("c1").unwrap().state, CommandState::Cancelled);

        assert!(matches!(
            queue.cancel("c1"),
            Err(CancelError::AlreadyTerminal { .. })
        ));
        assert!(matches!(queue.cancel("nope"), Err(CancelError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_after_dequeue_is_too_late() {
        let (queue, _monitor) = queue(10);
        let ticket = queue.enqueue(read("c1", 1)).unwrap();
        let dispatch = queue.next().await.unwrap();

        assert_eq!(
            queue.cancel("c1"),
            Err(CancelError::TooLate("c1".to_string()))
        );

        let output = CommandOutput::Written { address: 1, count: 1 };
        queue.finish(dispatch, CommandResult::completed("c1", output, 1));
        let result = ticket.wait().await;
        assert_eq!(result.state, CommandState::Completed);
    }

    #[tokio::test]
    async fn close_cancels_pending_and_ends_next() {
        let (queue, _monitor) = queue(10);
        let first = queue.enqueue(read("a", 1)).unwrap();
        let second = queue.enqueue(read("b", 2)).unwrap();

        assert_eq!(queue.close(), 2);
        assert_eq!(first.wait().await.state, CommandState::Cancelled);
        assert_eq!(second.wait().await.state, CommandState::Cancelled);
        assert!(queue.next().await.is_none());
        assert_eq!(queue.enqueue(read("c", 3)).unwrap_err(), QueueError::Closed);
        assert_eq!(queue.stats().cancelled, 2);
    }

    #[tokio::test]
    async fn next_wakes_on_enqueue() {
        let (monitor, _rx) = HealthMonitor::new(5);
        let queue = Arc::new(CommandQueue::new(10, 10, monitor.handle()));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await.map(|d| d.command.id.clone()) })
        };
        tokio::task::yield_now().await;
        queue.enqueue(read("late", 1)).unwrap();

        assert_eq!(consumer.await.unwrap().as_deref(), Some("late"));
    }

    #[test]
    fn history_evicts_oldest_finished_record() {
        let (monitor, _rx) = HealthMonitor::new(5);
        let queue = CommandQueue::new(10, 2, monitor.handle());
        queue.enqueue(read("a", 1)).unwrap();
        queue.enqueue(read("b", 2)).unwrap();
        queue.cancel("b").unwrap();
        queue.enqueue(read("c", 3)).unwrap();

        assert_eq!(queue.record("a").unwrap().state, CommandState::Pending);
        assert!(queue.record("b").is_none());
        assert_eq!(queue.record("c").unwrap().state, CommandState::Pending);
    }

    #[test]
    fn history_never_drops_live_commands() {
        let (monitor, _rx) = HealthMonitor::new(5);
        let queue = CommandQueue::new(10, 2, monitor.handle());
        for (i, id) in ["a", "b", "c", "d"].into_iter().enumerate() {
            queue.enqueue(read(id, i as u16)).unwrap();
        }

        for id in ["a", "b", "c", "d"] {
            assert_eq!(queue.record(id).unwrap().state, CommandState::Pending);
        }

        queue.cancel("a").unwrap();
        queue.enqueue(read("e", 9)).unwrap();
        assert!(queue.record("a").is_none());
        assert!(queue.record("e").is_some());
    }
}
