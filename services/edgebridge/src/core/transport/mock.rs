//! Mock transport for testing
//!
//! Replies are scripted per call. Every exchange is recorded with its start
//! and finish instants so tests can check that no two exchanges overlapped.
//! Clones share state, so a test keeps one clone and hands another to the
//! executor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{Transport, TransportError};
use crate::core::protocols::modbus::frame::RtuRequest;

/// Scripted outcome of one call
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer reads with these values (cycled to the requested count) and
    /// echo writes
    Values(Vec<u16>),
    /// Return this response PDU verbatim
    Pdu(Vec<u8>),
    /// Fail with this error after the configured latency
    Fail(TransportError),
    /// Stay silent until the call's timeout elapses
    Silence,
}

/// One recorded exchange
#[derive(Debug, Clone)]
pub struct Exchange {
    pub slave_id: u8,
    pub request: Vec<u8>,
    pub started: Instant,
    pub finished: Instant,
    pub result: Result<Vec<u8>, TransportError>,
}

impl Exchange {
    pub fn function_code(&self) -> u8 {
        self.request.first().copied().unwrap_or(0)
    }

    /// Starting address field of the request PDU
    pub fn address(&self) -> u16 {
        match self.request.get(1..3) {
            Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
            None => 0,
        }
    }
}

#[derive(Debug)]
struct MockState {
    connected: bool,
    script: VecDeque<MockReply>,
    default_reply: MockReply,
    latency: Duration,
    exchanges: Vec<Exchange>,
    in_flight: usize,
    max_in_flight: usize,
    connect_attempts: u32,
    failing_connects: u32,
}

/// Mock transport implementation
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Connected mock answering every read with zeros
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                script: VecDeque::new(),
                default_reply: MockReply::Values(vec![0]),
                latency: Duration::from_millis(10),
                exchanges: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
                connect_attempts: 0,
                failing_connects: 0,
            })),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Reply used once the script is exhausted
    pub fn with_default_reply(self, reply: MockReply) -> Self {
        self.state.lock().default_reply = reply;
        self
    }

    pub fn disconnected(self) -> Self {
        self.state.lock().connected = false;
        self
    }

    /// Queue a reply for the next unscripted call
    pub fn push_reply(&self, reply: MockReply) {
        self.state.lock().script.push_back(reply);
    }

    pub fn push_replies(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.state.lock().script.extend(replies);
    }

    pub fn set_default_reply(&self, reply: MockReply) {
        self.state.lock().default_reply = reply;
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.state.lock().exchanges.clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().exchanges.len()
    }

    /// Highest number of exchanges observed in progress at once
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::LinkUnavailable(
                "Mock connect failure".to_string(),
            ));
        }
        state.connected = true;
        debug!("Mock transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn execute(
        &mut self,
        request: &RtuRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let started = Instant::now();
        let (reply, latency) = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::LinkUnavailable(
                    "Mock transport not connected".to_string(),
                ));
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            let reply = state
                .script
                .pop_front()
                .unwrap_or_else(|| state.default_reply.clone());
            (reply, state.latency)
        };

        let result = match reply {
            MockReply::Silence => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            },
            _ if latency > timeout => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            },
            MockReply::Values(values) => {
                tokio::time::sleep(latency).await;
                Ok(auto_response(&request.pdu, &values))
            },
            MockReply::Pdu(pdu) => {
                tokio::time::sleep(latency).await;
                Ok(pdu)
            },
            MockReply::Fail(error) => {
                tokio::time::sleep(latency).await;
                Err(error)
            },
        };

        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.exchanges.push(Exchange {
            slave_id: request.slave_id,
            request: request.pdu.clone(),
            started,
            finished: Instant::now(),
            result: result.clone(),
        });
        result
    }
}

/// Build a well-formed response PDU for `request`
fn auto_response(request: &[u8], values: &[u16]) -> Vec<u8> {
    let function = request.first().copied().unwrap_or(0);
    let count = match request.get(3..5) {
        Some(bytes) => usize::from(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => 0,
    };
    let value_at = |i: usize| {
        if values.is_empty() {
            0
        } else {
            values[i % values.len()]
        }
    };

    match function {
        0x01 | 0x02 => {
            let mut packed = vec![0u8; count.div_ceil(8)];
            for i in 0..count {
                if value_at(i) != 0 {
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            let mut pdu = vec![function, packed.len() as u8];
            pdu.extend_from_slice(&packed);
            pdu
        },
        0x03 | 0x04 => {
            let mut pdu = vec![function, (count * 2) as u8];
            for i in 0..count {
                pdu.extend_from_slice(&value_at(i).to_be_bytes());
            }
            pdu
        },
        _ => request.iter().take(5).copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(address: u16, count: u16) -> RtuRequest {
        let mut pdu = vec![0x03];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        RtuRequest::new(1, pdu)
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_replies_then_default() {
        let mut mock = MockTransport::new().with_default_reply(MockReply::Values(vec![7]));
        mock.push_reply(MockReply::Fail(TransportError::FrameCorrupt("noise".into())));

        let first = mock.execute(&read(10, 2), Duration::from_secs(1)).await;
        assert!(matches!(first, Err(TransportError::FrameCorrupt(_))));

        let second = mock.execute(&read(10, 2), Duration::from_secs(1)).await;
        assert_eq!(second, Ok(vec![0x03, 0x04, 0x00, 0x07, 0x00, 0x07]));
        assert_eq!(mock.exchange_count(), 2);
        assert_eq!(mock.exchanges()[1].address(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_consumes_the_full_timeout() {
        let mut mock = MockTransport::new();
        mock.push_reply(MockReply::Silence);

        let before = Instant::now();
        let result = mock.execute(&read(0, 1), Duration::from_millis(250)).await;
        assert_eq!(result, Err(TransportError::Timeout(Duration::from_millis(250))));
        assert!(before.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn disconnected_mock_rejects_until_connected() {
        let mut mock = MockTransport::new().disconnected();
        mock.fail_connects(1);

        let result = mock.execute(&read(0, 1), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::LinkUnavailable(_))));
        assert!(mock.connect().await.is_err());
        assert!(mock.connect().await.is_ok());
        assert!(mock.is_connected());
        assert_eq!(mock.connect_attempts(), 2);
    }

    #[test]
    fn auto_response_packs_coils_and_echoes_writes() {
        assert_eq!(
            auto_response(&[0x01, 0x00, 0x00, 0x00, 0x03], &[1, 0]),
            vec![0x01, 0x01, 0b0000_0101]
        );
        assert_eq!(
            auto_response(&[0x06, 0x00, 0x10, 0x03, 0xE8], &[]),
            vec![0x06, 0x00, 0x10, 0x03, 0xE8]
        );
    }
}
