//! Transport layer
//!
//! - `traits`: the `Transport` trait and its error type
//! - `serial`: Modbus RTU over a serial port
//! - `mock`: scriptable in-memory transport for tests and dry runs

pub mod mock;
pub mod serial;
pub mod traits;

pub use mock::{Exchange, MockReply, MockTransport};
pub use serial::{SerialTransport, SerialTransportConfig};
pub use traits::{Transport, TransportError};
