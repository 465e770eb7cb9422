/*!
 * Transport and GPIO capabilities consumed by the port state machine.
 *
 * Byte-level UART and GPIO drivers live outside this crate. A port only sees
 * them through these two traits, which report typed [`TransportError`]s.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;
use crate::options::PortOptions;

/// Result type for transport and GPIO operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Asynchronous serial transport.
///
/// Methods take `&self`; implementations keep their own interior state so a
/// reader and a writer can use the transport at the same time.
#[async_trait]
pub trait SerialTransport: Send + Sync + Debug {
    /// Open the device at `path` with the given options
    async fn open(&self, path: &str, options: &PortOptions) -> TransportResult<()>;

    /// Read up to `max_len` bytes.
    ///
    /// An empty chunk means nothing arrived within the transport's own read
    /// timeout; callers poll again.
    async fn read(&self, max_len: usize) -> TransportResult<Bytes>;

    /// Write all of `data`
    async fn write(&self, data: &[u8]) -> TransportResult<()>;

    /// Wait until every written byte has left the transmitter
    async fn drain(&self) -> TransportResult<()>;

    /// Discard buffered input and output
    async fn flush(&self) -> TransportResult<()>;

    /// Apply new options to an open device
    async fn reconfigure(&self, options: &PortOptions) -> TransportResult<()>;

    /// Close the device
    async fn close(&self) -> TransportResult<()>;
}

/// Direction of a GPIO line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpioDirection {
    /// Line is sampled
    Input,
    /// Line is driven
    Output,
}

/// A single GPIO line, used only for RS-485 transmit-enable
pub trait GpioLine: Send + Sync + Debug {
    /// Drive the line high (`true`) or low
    fn write(&self, high: bool) -> TransportResult<()>;

    /// Sample the line level
    fn read(&self) -> TransportResult<bool>;

    /// Change the line direction
    fn set_direction(&self, direction: GpioDirection) -> TransportResult<()>;

    /// Hand the line back to the system
    fn unexport(&self) -> TransportResult<()>;
}
