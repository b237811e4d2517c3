//! Transaction executor
//!
//! Turns one [`Command`] into exactly one terminal [`CommandResult`] with a
//! bounded retry loop. The executor owns the transport, so it is the only
//! caller of `Transport::execute`. Every attempt is reported to the health
//! monitor exactly once.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::core::command::{Command, CommandResult, CommandState};
use crate::core::health::{HealthHandle, HealthMonitor};
use crate::core::protocols::modbus::{decode_response, encode_request, RtuRequest};
use crate::core::transport::{Transport, TransportError};

/// Retry timing
///
/// A multiplier of 1.0 gives the fixed-delay schedule. Larger values grow the
/// delay geometrically up to `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Cumulative time budget for one command across all attempts
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, ceiling: Duration) -> Self {
        Self {
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay.max(Duration::from_secs(30)),
            ceiling,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let secs = self.delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Executes commands against the device, one at a time
#[derive(Debug)]
pub struct TransactionExecutor {
    transport: Box<dyn Transport>,
    health: HealthMonitor,
    policy: RetryPolicy,
    slave_id: u8,
}

impl TransactionExecutor {
    pub fn new(
        transport: Box<dyn Transport>,
        health: HealthMonitor,
        policy: RetryPolicy,
        slave_id: u8,
    ) -> Self {
        Self {
            transport,
            health,
            policy,
            slave_id,
        }
    }

    pub fn health(&self) -> HealthHandle {
        self.health.handle()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open the link before the first command
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.transport.connect().await
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("Error closing {}: {}", self.transport.name(), e);
        }
    }

    /// Run `command` to a terminal outcome
    pub async fn execute(&mut self, command: &Command) -> CommandResult {
        let started = Instant::now();
        let ceiling_at = started + self.policy.ceiling;
        let request = RtuRequest::new(self.slave_id, encode_request(&command.operation));
        let budget = command.attempt_budget();
        let mut attempts = 0u32;

        debug!(
            command_id = %command.id,
            operation = command.operation.name(),
            priority = %command.priority,
            "Executing command"
        );

        loop {
            let remaining = ceiling_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.ceiling_exceeded(command, attempts, None);
            }

            attempts += 1;
            let attempt_timeout = command.timeout.min(remaining);
            let error = match self.attempt(&request, attempt_timeout).await {
                Ok(pdu) => match decode_response(&command.operation, &pdu) {
                    Ok(output) => {
                        self.health.record_success();
                        debug!(command_id = %command.id, attempt = attempts, "Command completed");
                        return CommandResult::completed(&command.id, output, attempts);
                    },
                    Err(e) => TransportError::FrameCorrupt(e.to_string()),
                },
                Err(e) => e,
            };

            match error {
                TransportError::Io(_) => self.health.record_link_lost(&error.to_string()),
                _ => self.health.record_failure(&error.to_string()),
            }

            if !error.is_retryable() {
                warn!(
                    command_id = %command.id,
                    attempt = attempts,
                    error_kind = error.kind(),
                    "Command failed without retry: {}",
                    error
                );
                let result = CommandResult::unsuccessful(
                    &command.id,
                    CommandState::Failed,
                    error.to_string(),
                    attempts,
                );
                return match error.exception() {
                    Some(exception) => result.with_exception(exception),
                    None => result,
                };
            }

            if attempts >= budget {
                let state = match error {
                    TransportError::Timeout(_) => CommandState::Timeout,
                    _ => CommandState::Failed,
                };
                warn!(
                    command_id = %command.id,
                    attempts,
                    "Command {} after exhausting retries: {}",
                    state,
                    error
                );
                let result = CommandResult::unsuccessful(
                    &command.id,
                    state,
                    format!("{} (after {} attempts)", error, attempts),
                    attempts,
                );
                return match error.exception() {
                    Some(exception) => result.with_exception(exception),
                    None => result,
                };
            }

            let delay = self.policy.delay_for(attempts);
            if Instant::now() + delay >= ceiling_at {
                return self.ceiling_exceeded(command, attempts, Some(&error));
            }

            warn!(
                command_id = %command.id,
                attempt = attempts,
                max_attempts = budget,
                error_kind = error.kind(),
                "Attempt failed, retrying in {:?}: {}",
                delay,
                error
            );
            sleep(delay).await;
        }
    }

    async fn attempt(
        &mut self,
        request: &RtuRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.transport.is_connected() {
            info!("Reopening link {}", self.transport.name());
            self.transport.connect().await?;
        }
        self.transport.execute(request, timeout).await
    }

    fn ceiling_exceeded(
        &self,
        command: &Command,
        attempts: u32,
        last_error: Option<&TransportError>,
    ) -> CommandResult {
        warn!(
            command_id = %command.id,
            attempts,
            ceiling = ?self.policy.ceiling,
            "Command truncated at cumulative time ceiling"
        );
        let reason = match last_error {
            Some(e) => format!(
                "exceeded {:?} command ceiling after {} attempts: {}",
                self.policy.ceiling, attempts, e
            ),
            None => format!(
                "exceeded {:?} command ceiling after {} attempts",
                self.policy.ceiling, attempts
            ),
        };
        CommandResult::unsuccessful(&command.id, CommandState::Timeout, reason, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::Operation;
    use crate::core::health::HealthStatus;
    use crate::core::protocols::modbus::ExceptionCode;
    use crate::core::transport::{MockReply, MockTransport};

    fn read_command(id: &str) -> Command {
        Command::new(
            id,
            "inverter-001",
            Operation::ReadHoldingRegisters {
                address: 3021,
                count: 2,
            },
        )
        .with_timeout(Duration::from_secs(1))
        .with_max_retries(3)
    }

    fn executor(mock: &MockTransport, policy: RetryPolicy) -> TransactionExecutor {
        let (monitor, _rx) = HealthMonitor::new(5);
        TransactionExecutor::new(Box::new(mock.clone()), monitor, policy, 1)
    }

    fn exception(code: u8) -> MockReply {
        MockReply::Fail(TransportError::ProtocolException {
            function: 0x03,
            exception: ExceptionCode::from_u8(code),
        })
    }

    #[test]
    fn fixed_policy_keeps_delay_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn exponential_policy_is_capped() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1000), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let mock = MockTransport::new().with_default_reply(MockReply::Values(vec![230, 50]));
        let mut executor = executor(&mock, RetryPolicy::default());

        let result = executor.execute(&read_command("c1")).await;
        assert_eq!(result.state, CommandState::Completed);
        assert_eq!(result.attempts, 1);
        let registers = result.registers().unwrap();
        assert_eq!(registers.get(&3021), Some(&230));
        assert_eq!(registers.get(&3022), Some(&50));
        assert_eq!(executor.health().snapshot().total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_timing_out_makes_exactly_max_retries_attempts() {
        let mock = MockTransport::new().with_default_reply(MockReply::Silence);
        let mut executor = executor(&mock, RetryPolicy::default());

        let result = executor.execute(&read_command("c1")).await;
        assert_eq!(result.state, CommandState::Timeout);
        assert_eq!(result.attempts, 3);
        assert_eq!(mock.exchange_count(), 3);

        let health = executor.health().snapshot();
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_corrupt_frames_then_succeeds() {
        let mock = MockTransport::new().with_default_reply(MockReply::Values(vec![1]));
        mock.push_replies([
            MockReply::Fail(TransportError::FrameCorrupt("crc".into())),
            MockReply::Fail(TransportError::FrameCorrupt("crc".into())),
        ]);
        let mut executor = executor(&mock, RetryPolicy::default());

        let started = Instant::now();
        let result = executor.execute(&read_command("c1")).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        // two fixed 1s delays between attempts
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(executor.health().status(), HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn illegal_address_fails_immediately_with_exception() {
        let mock = MockTransport::new();
        mock.push_reply(exception(0x02));
        let mut executor = executor(&mock, RetryPolicy::default());

        let result = executor.execute(&read_command("c1")).await;
        assert_eq!(result.state, CommandState::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.exception, Some(ExceptionCode::IllegalDataAddress));
        assert!(result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("illegal data address"));
        assert_eq!(mock.exchange_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_is_retried_and_ends_failed() {
        let mock = MockTransport::new().with_default_reply(exception(0x06));
        let mut executor = executor(&mock, RetryPolicy::default());

        let result = executor.execute(&read_command("c1")).await;
        assert_eq!(result.state, CommandState::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.exception, Some(ExceptionCode::ServerDeviceBusy));
    }

    #[tokio::test(start_paused = true)]
    async fn cumulative_ceiling_truncates_to_timeout() {
        let mock = MockTransport::new().with_default_reply(MockReply::Silence);
        let policy = RetryPolicy::fixed(Duration::from_secs(1), Duration::from_millis(2500));
        let mut executor = executor(&mock, policy);

        let started = Instant::now();
        let result = executor
            .execute(&read_command("c1").with_max_retries(10))
            .await;
        assert_eq!(result.state, CommandState::Timeout);
        assert_eq!(result.attempts, 2);
        assert!(started.elapsed() < Duration::from_millis(2600));
        assert!(result.error.unwrap_or_default().contains("ceiling"));
    }

    #[tokio::test(start_paused = true)]
    async fn reopens_link_before_next_attempt() {
        let mock = MockTransport::new().disconnected();
        mock.fail_connects(1);
        let mut executor = executor(&mock, RetryPolicy::default());

        let result = executor.execute(&read_command("c1")).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
        assert_eq!(mock.connect_attempts(), 2);
        assert_eq!(executor.health().snapshot().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_port_takes_link_offline_at_once() {
        let mock = MockTransport::new();
        mock.push_reply(MockReply::Fail(TransportError::Io(
            "device reports bad file descriptor".into(),
        )));
        let mut executor = executor(&mock, RetryPolicy::default());

        let result = executor.execute(&read_command("c1")).await;
        assert_eq!(result.state, CommandState::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(mock.exchange_count(), 1);

        let health = executor.health().snapshot();
        assert_eq!(health.status, HealthStatus::Offline);
        assert_eq!(health.consecutive_failures, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_response_is_treated_as_corrupt() {
        let mock = MockTransport::new().with_default_reply(MockReply::Values(vec![1]));
        // byte count says one register, command asked for two
        mock.push_reply(MockReply::Pdu(vec![0x03, 0x02, 0x00, 0x01]));
        let mut executor = executor(&mock, RetryPolicy::default());

        let result = executor.execute(&read_command("c1")).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
    }
}
