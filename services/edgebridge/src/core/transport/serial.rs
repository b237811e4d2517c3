//! Serial transport implementation
//!
//! Modbus RTU over a tokio-serial port. Each call writes one ADU, then reads
//! until the length predicted from the response header has arrived.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use super::traits::{Transport, TransportError};
use crate::core::protocols::modbus::frame::{
    expected_response_length, frame_gap, hex, RtuFrame, RtuRequest, MAX_ADU_SIZE,
};
use crate::core::protocols::modbus::ExceptionCode;

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialTransportConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity ("none", "even", "odd")
    pub parity: String,
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
        }
    }
}

impl SerialTransportConfig {
    fn parse_parity(&self) -> tokio_serial::Parity {
        match self.parity.to_ascii_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    fn parse_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn parse_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Serial transport implementation
pub struct SerialTransport {
    config: SerialTransportConfig,
    port: Option<SerialStream>,
    frame_gap: Duration,
    last_exchange: Option<Instant>,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.config.port)
            .field("baud_rate", &self.config.baud_rate)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    pub fn new(config: SerialTransportConfig) -> Self {
        let frame_gap = frame_gap(config.baud_rate);
        Self {
            config,
            port: None,
            frame_gap,
            last_exchange: None,
        }
    }

    pub fn config(&self) -> &SerialTransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.port
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!("Opening serial port: {}", self.config.port);

        let port_result = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.parse_data_bits())
            .parity(self.config.parse_parity())
            .stop_bits(self.config.parse_stop_bits())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async();

        match port_result {
            Ok(mut port) => {
                #[cfg(unix)]
                port.set_exclusive(false)
                    .map_err(|e| TransportError::Io(format!("Failed to set exclusive mode: {e}")))?;

                if let Err(e) = port.clear(ClearBuffer::Input) {
                    warn!("Failed to clear input buffer on {}: {}", self.config.port, e);
                }

                self.port = Some(port);
                self.last_exchange = None;
                info!(
                    "Opened serial port {} at {} baud",
                    self.config.port, self.config.baud_rate
                );
                Ok(())
            },
            Err(e) => {
                let error_msg = format!("Failed to open serial port {}: {e}", self.config.port);
                error!("{error_msg}");
                Err(TransportError::LinkUnavailable(error_msg))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!("Closed serial port: {}", self.config.port);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn execute(
        &mut self,
        request: &RtuRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let Some(port) = self.port.as_mut() else {
            return Err(TransportError::LinkUnavailable(format!(
                "Serial port {} not open",
                self.config.port
            )));
        };

        if let Some(last) = self.last_exchange {
            sleep_until(last + self.frame_gap).await;
        }

        let result = exchange(port, request, timeout).await;
        self.last_exchange = Some(Instant::now());

        if let Err(TransportError::LinkUnavailable(reason)) = &result {
            warn!("Dropping serial port {}: {}", self.config.port, reason);
            self.port = None;
        }
        result
    }
}

/// One request/response exchange over any byte stream
///
/// Returns the response PDU (without address and CRC).
pub(crate) async fn exchange<S>(
    stream: &mut S,
    request: &RtuRequest,
    response_timeout: Duration,
) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    discard_stale_input(stream).await;

    let frame = RtuFrame::from(request).to_bytes();
    debug!(hex_data = %hex(&frame), length = frame.len(), direction = "send", "[RTU] Raw frame");

    let deadline = Instant::now() + response_timeout;
    let write = async {
        stream.write_all(&frame).await?;
        stream.flush().await
    };
    match timeout_at(deadline, write).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
            return Err(TransportError::LinkUnavailable(format!("Write failed: {e}")));
        },
        Err(_) => return Err(TransportError::Timeout(response_timeout)),
    }

    let mut buffer = BytesMut::with_capacity(MAX_ADU_SIZE);
    let mut chunk = [0u8; MAX_ADU_SIZE];
    loop {
        if let Some(expected) = expected_response_length(&buffer) {
            if expected > MAX_ADU_SIZE {
                return Err(TransportError::FrameCorrupt(format!(
                    "Announced length {expected} exceeds maximum ADU size"
                )));
            }
            if buffer.len() >= expected {
                buffer.truncate(expected);
                break;
            }
        }

        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                return Err(TransportError::LinkUnavailable(
                    "Port closed while awaiting response".to_string(),
                ));
            },
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                return Err(TransportError::LinkUnavailable(format!("Read failed: {e}")));
            },
            Err(_) => {
                if !buffer.is_empty() {
                    debug!(hex_data = %hex(&buffer), "[RTU] Partial response before timeout");
                }
                return Err(TransportError::Timeout(response_timeout));
            },
        }
    }

    debug!(hex_data = %hex(&buffer), length = buffer.len(), direction = "recv", "[RTU] Raw frame");
    parse_response(request, &buffer)
}

/// Drop bytes left over from an exchange that timed out
async fn discard_stale_input<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; MAX_ADU_SIZE];
    let mut discarded = 0usize;
    while let Ok(Ok(n)) = timeout(Duration::ZERO, stream.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
        discarded += n;
    }
    if discarded > 0 {
        warn!(discarded, "[RTU] Discarded stale bytes before request");
    }
}

fn parse_response(request: &RtuRequest, adu: &[u8]) -> Result<Vec<u8>, TransportError> {
    let frame =
        RtuFrame::from_bytes(adu).map_err(|defect| TransportError::FrameCorrupt(defect.to_string()))?;

    if frame.slave_address != request.slave_id {
        return Err(TransportError::FrameCorrupt(format!(
            "Slave address mismatch: sent {}, received {}",
            request.slave_id, frame.slave_address
        )));
    }

    let function = request.function_code();
    let received = frame.pdu.first().copied().unwrap_or(0);
    if received == function | 0x80 {
        let code = frame.pdu.get(1).copied().unwrap_or(0);
        return Err(TransportError::ProtocolException {
            function,
            exception: ExceptionCode::from_u8(code),
        });
    }
    if received != function {
        return Err(TransportError::FrameCorrupt(format!(
            "Function code mismatch: sent 0x{function:02X}, received 0x{received:02X}"
        )));
    }

    Ok(frame.pdu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocols::modbus::calculate_crc;
    use tokio::io::DuplexStream;

    fn adu(body: &[u8]) -> Vec<u8> {
        let mut bytes = body.to_vec();
        bytes.extend_from_slice(&calculate_crc(body).to_le_bytes());
        bytes
    }

    fn read_request() -> RtuRequest {
        RtuRequest::new(0x01, vec![0x03, 0x00, 0x01, 0x00, 0x01])
    }

    async fn device_replies(mut device: DuplexStream, reply: Vec<u8>) -> DuplexStream {
        let mut request = [0u8; 8];
        let _ = device.read_exact(&mut request).await;
        let _ = device.write_all(&reply).await;
        device
    }

    #[tokio::test]
    async fn exchange_returns_response_pdu() {
        let (mut client, device) = tokio::io::duplex(256);
        let reply = vec![0x01, 0x03, 0x02, 0x00, 0x64, 0xB9, 0xAF];

        let request = read_request();
        let (result, _device) = tokio::join!(
            exchange(&mut client, &request, Duration::from_secs(1)),
            device_replies(device, reply)
        );
        assert_eq!(result, Ok(vec![0x03, 0x02, 0x00, 0x64]));
    }

    #[tokio::test]
    async fn exchange_maps_exception_response() {
        let (mut client, device) = tokio::io::duplex(256);
        let reply = adu(&[0x01, 0x83, 0x02]);

        let request = read_request();
        let (result, _device) = tokio::join!(
            exchange(&mut client, &request, Duration::from_secs(1)),
            device_replies(device, reply)
        );
        assert_eq!(
            result,
            Err(TransportError::ProtocolException {
                function: 0x03,
                exception: ExceptionCode::IllegalDataAddress,
            })
        );
    }

    #[tokio::test]
    async fn exchange_rejects_bad_crc() {
        let (mut client, device) = tokio::io::duplex(256);
        let reply = vec![0x01, 0x03, 0x02, 0x00, 0x64, 0x00, 0x00];

        let request = read_request();
        let (result, _device) = tokio::join!(
            exchange(&mut client, &request, Duration::from_secs(1)),
            device_replies(device, reply)
        );
        assert!(matches!(result, Err(TransportError::FrameCorrupt(_))));
    }

    #[tokio::test]
    async fn exchange_rejects_foreign_slave_address() {
        let (mut client, device) = tokio::io::duplex(256);
        let reply = adu(&[0x02, 0x03, 0x02, 0x00, 0x64]);

        let request = read_request();
        let (result, _device) = tokio::join!(
            exchange(&mut client, &request, Duration::from_secs(1)),
            device_replies(device, reply)
        );
        assert!(matches!(result, Err(TransportError::FrameCorrupt(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_times_out_without_response() {
        let (mut client, mut device) = tokio::io::duplex(256);

        let silent_device = async move {
            let mut request = [0u8; 8];
            let _ = device.read_exact(&mut request).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            device
        };

        let request = read_request();
        let (result, _device) = tokio::join!(
            exchange(&mut client, &request, Duration::from_millis(100)),
            silent_device
        );
        assert_eq!(result, Err(TransportError::Timeout(Duration::from_millis(100))));
    }

    #[tokio::test]
    async fn exchange_discards_late_bytes_from_previous_call() {
        let (mut client, mut device) = tokio::io::duplex(256);

        // Late answer to an earlier, timed-out request
        device
            .write_all(&adu(&[0x01, 0x03, 0x02, 0x12, 0x34]))
            .await
            .unwrap();

        let reply = vec![0x01, 0x03, 0x02, 0x00, 0x64, 0xB9, 0xAF];
        let request = read_request();
        let (result, _device) = tokio::join!(
            exchange(&mut client, &request, Duration::from_secs(1)),
            device_replies(device, reply)
        );
        assert_eq!(result, Ok(vec![0x03, 0x02, 0x00, 0x64]));
    }

    #[tokio::test]
    async fn exchange_reports_closed_port() {
        let (mut client, mut device) = tokio::io::duplex(256);

        let vanishing_device = async move {
            let mut request = [0u8; 8];
            let _ = device.read_exact(&mut request).await;
            drop(device);
        };

        let request = read_request();
        let (result, ()) = tokio::join!(
            exchange(&mut client, &request, Duration::from_secs(1)),
            vanishing_device
        );
        assert!(matches!(result, Err(TransportError::LinkUnavailable(_))));
    }

    #[tokio::test]
    async fn unopened_serial_transport_is_link_unavailable() {
        let mut transport = SerialTransport::new(SerialTransportConfig::default());
        assert!(!transport.is_connected());

        let result = transport
            .execute(&read_request(), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(TransportError::LinkUnavailable(_))));
    }

    #[test]
    fn serial_config_parsing() {
        let config = SerialTransportConfig {
            parity: "Even".to_string(),
            data_bits: 7,
            stop_bits: 2,
            ..Default::default()
        };
        assert_eq!(config.parse_parity(), tokio_serial::Parity::Even);
        assert_eq!(config.parse_data_bits(), tokio_serial::DataBits::Seven);
        assert_eq!(config.parse_stop_bits(), tokio_serial::StopBits::Two);
    }
}
