//! Link health state machine
//!
//! `HEALTHY -> DEGRADED -> OFFLINE`, driven by transaction outcomes. Any
//! success returns straight to HEALTHY and zeroes the failure counter.
//!
//! [`HealthMonitor`] is the only writer. Everyone else reads through a
//! [`HealthHandle`], a `watch` receiver that always holds the latest state.
//! Status changes are also pushed as [`HealthTransition`]s so the gateway can
//! alert exactly once per transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Offline,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

/// Snapshot of link health
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub total_attempts: u64,
    pub total_failures: u64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            total_attempts: 0,
            total_failures: 0,
        }
    }
}

/// A change of [`HealthStatus`]
#[derive(Debug, Clone, PartialEq)]
pub struct HealthTransition {
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub state: HealthState,
}

impl HealthTransition {
    pub fn entered_offline(&self) -> bool {
        self.to == HealthStatus::Offline
    }

    pub fn left_offline(&self) -> bool {
        self.from == HealthStatus::Offline
    }
}

/// Sole writer of [`HealthState`]
#[derive(Debug)]
pub struct HealthMonitor {
    max_consecutive_failures: u32,
    state: watch::Sender<HealthState>,
    transitions: mpsc::UnboundedSender<HealthTransition>,
}

impl HealthMonitor {
    /// Create a monitor and the receiving end of its transition stream
    pub fn new(max_consecutive_failures: u32) -> (Self, mpsc::UnboundedReceiver<HealthTransition>) {
        let (state, _) = watch::channel(HealthState::default());
        let (transitions, rx) = mpsc::unbounded_channel();
        (
            Self {
                max_consecutive_failures: max_consecutive_failures.max(1),
                state,
                transitions,
            },
            rx,
        )
    }

    /// Read-only view for other components
    pub fn handle(&self) -> HealthHandle {
        HealthHandle {
            rx: self.state.subscribe(),
        }
    }

    pub fn record_success(&self) {
        let now = Utc::now();
        self.apply(|state| {
            state.total_attempts += 1;
            state.consecutive_failures = 0;
            state.last_success_at = Some(now);
            state.status = HealthStatus::Healthy;
        });
    }

    pub fn record_failure(&self, reason: &str) {
        let now = Utc::now();
        let threshold = self.max_consecutive_failures;
        self.apply(|state| {
            state.total_attempts += 1;
            state.total_failures += 1;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_failure_at = Some(now);
            state.last_error = Some(reason.to_string());
            state.status = if state.consecutive_failures >= threshold {
                HealthStatus::Offline
            } else {
                HealthStatus::Degraded
            };
        });
    }

    /// A failure that leaves the link unusable: OFFLINE at once
    pub fn record_link_lost(&self, reason: &str) {
        let now = Utc::now();
        let threshold = self.max_consecutive_failures;
        self.apply(|state| {
            state.total_attempts += 1;
            state.total_failures += 1;
            state.consecutive_failures =
                state.consecutive_failures.saturating_add(1).max(threshold);
            state.last_failure_at = Some(now);
            state.last_error = Some(reason.to_string());
            state.status = HealthStatus::Offline;
        });
    }

    fn apply(&self, update: impl FnOnce(&mut HealthState)) {
        let mut previous = HealthStatus::Healthy;
        self.state.send_modify(|state| {
            previous = state.status;
            update(state);
        });

        let current = self.state.borrow().clone();
        if current.status == previous {
            return;
        }

        match current.status {
            HealthStatus::Offline => error!(
                consecutive_failures = current.consecutive_failures,
                "Link OFFLINE: {}",
                current.last_error.as_deref().unwrap_or("unknown error")
            ),
            HealthStatus::Degraded => warn!(
                consecutive_failures = current.consecutive_failures,
                "Link DEGRADED: {}",
                current.last_error.as_deref().unwrap_or("unknown error")
            ),
            HealthStatus::Healthy => info!("Link recovered from {}", previous),
        }

        // Receiver gone means the bridge is shutting down
        let _ = self.transitions.send(HealthTransition {
            from: previous,
            to: current.status,
            state: current,
        });
    }
}

/// Read-only access to the current [`HealthState`]
#[derive(Debug, Clone)]
pub struct HealthHandle {
    rx: watch::Receiver<HealthState>,
}

impl HealthHandle {
    pub fn snapshot(&self) -> HealthState {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> HealthStatus {
        self.rx.borrow().status
    }

    pub fn is_offline(&self) -> bool {
        self.status() == HealthStatus::Offline
    }

    /// Wait until the status matches `status`
    pub async fn wait_for(&mut self, status: HealthStatus) -> HealthState {
        let found = self
            .rx
            .wait_for(|state| state.status == status)
            .await
            .map(|state| state.clone());
        match found {
            Ok(state) => state,
            // Monitor dropped; report whatever was last published
            Err(_) => self.rx.borrow().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let (monitor, _rx) = HealthMonitor::new(5);
        let state = monitor.handle().snapshot();
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_success_at.is_none());
    }

    #[test]
    fn five_failures_go_offline_once() {
        let (monitor, mut rx) = HealthMonitor::new(5);
        let handle = monitor.handle();

        monitor.record_failure("timeout");
        assert_eq!(handle.status(), HealthStatus::Degraded);
        for _ in 0..3 {
            monitor.record_failure("timeout");
        }
        assert_eq!(handle.status(), HealthStatus::Degraded);
        monitor.record_failure("timeout");
        assert_eq!(handle.status(), HealthStatus::Offline);
        monitor.record_failure("timeout");
        monitor.record_failure("timeout");
        assert_eq!(handle.snapshot().consecutive_failures, 7);

        let first = rx.try_recv().unwrap();
        assert_eq!((first.from, first.to), (HealthStatus::Healthy, HealthStatus::Degraded));
        let second = rx.try_recv().unwrap();
        assert!(second.entered_offline());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn single_success_restores_healthy() {
        let (monitor, mut rx) = HealthMonitor::new(2);
        monitor.record_failure("crc");
        monitor.record_failure("crc");
        monitor.record_success();

        let state = monitor.handle().snapshot();
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_success_at.is_some());
        assert_eq!(state.total_attempts, 3);
        assert_eq!(state.total_failures, 2);

        let transitions: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(transitions.len(), 3);
        assert!(transitions[2].left_offline());
        assert_eq!(transitions[2].to, HealthStatus::Healthy);
    }

    #[test]
    fn threshold_of_one_goes_straight_offline() {
        let (monitor, mut rx) = HealthMonitor::new(1);
        monitor.record_failure("gone");
        assert!(monitor.handle().is_offline());
        let transition = rx.try_recv().unwrap();
        assert_eq!(transition.from, HealthStatus::Healthy);
        assert!(transition.entered_offline());
    }

    #[test]
    fn lost_link_goes_offline_without_waiting_for_threshold() {
        let (monitor, mut rx) = HealthMonitor::new(5);
        monitor.record_link_lost("port vanished");

        let state = monitor.handle().snapshot();
        assert_eq!(state.status, HealthStatus::Offline);
        assert_eq!(state.consecutive_failures, 5);
        let transition = rx.try_recv().unwrap();
        assert!(transition.entered_offline());
        assert!(rx.try_recv().is_err());

        monitor.record_success();
        assert_eq!(monitor.handle().status(), HealthStatus::Healthy);
    }

    #[test]
    fn success_while_healthy_emits_nothing() {
        let (monitor, mut rx) = HealthMonitor::new(3);
        monitor.record_success();
        monitor.record_success();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handle_waits_for_status() {
        let (monitor, _rx) = HealthMonitor::new(1);
        let mut handle = monitor.handle();
        let waiter = tokio::spawn(async move { handle.wait_for(HealthStatus::Offline).await });
        monitor.record_failure("unplugged");
        let state = waiter.await.unwrap();
        assert_eq!(state.status, HealthStatus::Offline);
        assert_eq!(state.last_error.as_deref(), Some("unplugged"));
    }

    #[test]
    fn status_serializes_uppercase() {
        let value = serde_json::to_value(HealthState::default()).unwrap();
        assert_eq!(value["status"], "HEALTHY");
        assert_eq!(value["consecutiveFailures"], 0);
    }
}
