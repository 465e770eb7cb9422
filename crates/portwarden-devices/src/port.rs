/*!
 * Port state machine.
 *
 * One [`PortStateMachine`] owns the lifecycle and I/O of one serial port:
 *
 * ```text
 * Closed → Opening → Open → Error
 * Open ⇄ Reconfiguring
 * Open → Draining → Closing → Closed
 * any → Blocked (unblock restores the prior state)
 * ```
 *
 * At most one write is in flight per port; writers queue on a FIFO async
 * mutex or fail fast depending on the [`WritePolicy`]. At most one reader is
 * attached at a time.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use portwarden_core::error::Error as CoreError;
use portwarden_core::event::{Priority, SharedEventBus, SourceReceiver, TypedEvent};
use portwarden_core::types::{Id, Timestamp};
use portwarden_core::utils::bounded;

use crate::capability::{PortCapabilities, Rs485Support};
use crate::direction::{DirectionController, DirectionMode};
use crate::error::{PortError, Result, TransportError};
use crate::options::{PortOptions, PortOptionsPatch, WritePolicy};
use crate::transport::{GpioLine, SerialTransport};

/// Physical interface of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortType {
    /// RS-232
    Rs232,
    /// Half-duplex RS-485
    Rs485,
    /// USB CDC / USB-to-serial bridge
    UsbSerial,
    /// Logic-level UART
    Ttl,
}

/// Lifecycle state of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortStatus {
    /// Not open
    Closed,
    /// Open in progress
    Opening,
    /// Ready for I/O
    Open,
    /// Failed; may be reopened
    Error,
    /// Options are being applied
    Reconfiguring,
    /// Waiting for pending output before close
    Draining,
    /// Close in progress
    Closing,
    /// Denied by the security governor
    Blocked,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Static identity of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port id
    pub id: Id,
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub path: String,
    /// Physical interface
    pub port_type: PortType,
}

impl PortInfo {
    /// Create port info
    pub fn new<I: Into<Id>, S: Into<String>>(id: I, path: S, port_type: PortType) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            port_type,
        }
    }
}

/// Counters kept per port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMetrics {
    /// Bytes handed to the transport
    pub bytes_written: u64,
    /// Bytes received from the transport
    pub bytes_read: u64,
    /// Completed writes
    pub writes: u64,
    /// Received chunks
    pub reads: u64,
    /// Failed operations
    pub errors: u64,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Time of the most recent state transition
    pub last_transition: Option<Timestamp>,
}

/// Event published on the shared bus for every port
#[derive(Debug, Clone)]
pub enum PortEvent {
    /// The port changed state
    StateChanged {
        /// Port id
        port_id: Id,
        /// Previous state
        from: PortStatus,
        /// New state
        to: PortStatus,
    },
    /// An operation failed
    Error {
        /// Port id
        port_id: Id,
        /// Failed operation
        operation: &'static str,
        /// Failure description
        message: String,
    },
    /// A write completed
    Written {
        /// Port id
        port_id: Id,
        /// Number of bytes written
        bytes: usize,
    },
}

#[derive(Debug)]
struct PortState {
    status: PortStatus,
    blocked_from: Option<PortStatus>,
    options: Arc<PortOptions>,
    direction: Option<Arc<DirectionController>>,
    metrics: PortMetrics,
}

/// State machine owning one serial port
#[derive(Debug)]
pub struct PortStateMachine {
    info: PortInfo,
    capabilities: PortCapabilities,
    transport: Arc<dyn SerialTransport>,
    gpio: Option<Arc<dyn GpioLine>>,
    events: SharedEventBus,
    state: Mutex<PortState>,
    write_lock: AsyncMutex<()>,
    reader_active: AtomicBool,
}

impl PortStateMachine {
    /// Create a closed port
    pub fn new(
        info: PortInfo,
        capabilities: PortCapabilities,
        transport: Arc<dyn SerialTransport>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            info,
            capabilities,
            transport,
            gpio: None,
            events,
            state: Mutex::new(PortState {
                status: PortStatus::Closed,
                blocked_from: None,
                options: Arc::new(PortOptions::default()),
                direction: None,
                metrics: PortMetrics::default(),
            }),
            write_lock: AsyncMutex::new(()),
            reader_active: AtomicBool::new(false),
        }
    }

    /// Attach the transmit-enable line used for GPIO-switched RS-485
    pub fn with_gpio(mut self, line: Arc<dyn GpioLine>) -> Self {
        self.gpio = Some(line);
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, PortState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::runtime(format!("Port {} state lock poisoned", self.info.id)).into())
    }

    /// Port id
    pub fn id(&self) -> &Id {
        &self.info.id
    }

    /// Static port identity
    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    /// Effective capabilities
    pub fn capabilities(&self) -> &PortCapabilities {
        &self.capabilities
    }

    /// Current state
    pub fn status(&self) -> Result<PortStatus> {
        Ok(self.state()?.status)
    }

    /// Current option snapshot
    pub fn options(&self) -> Result<Arc<PortOptions>> {
        Ok(self.state()?.options.clone())
    }

    /// Events raised by this port alone, from the bus it shares
    pub fn subscribe(&self) -> Result<SourceReceiver<PortEvent>> {
        Ok(self.events.subscribe_source(self.info.id.clone())?)
    }

    /// Counter snapshot
    pub fn metrics(&self) -> Result<PortMetrics> {
        Ok(self.state()?.metrics.clone())
    }

    /// Whether a reader is attached
    pub fn is_reading(&self) -> bool {
        self.reader_active.load(Ordering::SeqCst)
    }

    /// Whether the transmit-enable line is driven high right now
    pub fn is_transmitting(&self) -> Result<bool> {
        Ok(self
            .state()?
            .direction
            .as_ref()
            .map(|dc| dc.is_asserted())
            .unwrap_or(false))
    }

    fn transition(&self, state: &mut PortState, to: PortStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        state.status = to;
        state.metrics.last_transition = Some(chrono::Utc::now());
        debug!("Port {} {} -> {}", self.info.id, from, to);

        let priority = match to {
            PortStatus::Error | PortStatus::Blocked => Priority::High,
            _ => Priority::Normal,
        };
        self.publish(
            TypedEvent::new(
                "port.state_changed",
                PortEvent::StateChanged {
                    port_id: self.info.id.clone(),
                    from,
                    to,
                },
            )
            .with_priority(priority),
        );
    }

    // A state reached after an await lands behind a block that arrived meanwhile
    fn settle(&self, state: &mut PortState, to: PortStatus) {
        if state.status == PortStatus::Blocked {
            state.blocked_from = Some(to);
        } else {
            self.transition(state, to);
        }
    }

    fn publish(&self, event: TypedEvent<PortEvent>) {
        let event = event.with_source(self.info.id.clone());
        if let Err(e) = self.events.publish(event) {
            warn!("Failed to publish event for port {}: {}", self.info.id, e);
        }
    }

    fn record_failure(&self, operation: &'static str, err: &TransportError) {
        let mut state = match self.state() {
            Ok(state) => state,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        state.metrics.errors += 1;
        state.metrics.last_error = Some(err.to_string());

        if !err.is_transient() && state.status == PortStatus::Open {
            self.transition(&mut state, PortStatus::Error);
        }
        drop(state);

        warn!("Port {} {} failed: {}", self.info.id, operation, err);
        self.publish(
            TypedEvent::new(
                "port.error",
                PortEvent::Error {
                    port_id: self.info.id.clone(),
                    operation,
                    message: err.to_string(),
                },
            )
            .with_priority(Priority::High),
        );
    }

    fn require_open(&self, operation: &'static str) -> Result<()> {
        let status = self.status()?;
        if status != PortStatus::Open {
            return Err(PortError::invalid_state(operation, status));
        }
        Ok(())
    }

    fn check_options(&self, options: &PortOptions) -> Result<()> {
        options.validate(self.info.port_type, &self.capabilities)?;
        if options.rs485.is_some()
            && self.capabilities.rs485 == Rs485Support::GpioDirection
            && self.gpio.is_none()
        {
            return Err(PortError::configuration(
                "RS-485 direction control needs a transmit-enable line",
            ));
        }
        Ok(())
    }

    fn direction_controller(&self, options: &PortOptions) -> Result<Option<Arc<DirectionController>>> {
        let Some((pre, post)) = options.effective_timing(&self.capabilities) else {
            return Ok(None);
        };
        let mode = match (&self.capabilities.rs485, &self.gpio) {
            (Rs485Support::GpioDirection, Some(line)) => DirectionMode::Gpio(line.clone()),
            _ => DirectionMode::Native,
        };
        let controller = DirectionController::new(self.info.id.clone(), mode, pre, post)?;
        Ok(Some(Arc::new(controller)))
    }

    /// Open the port with the given options.
    ///
    /// Permitted from `Closed` and `Error`. Options that do not fit the
    /// port's capabilities fail with a configuration error and leave the
    /// state unchanged.
    pub async fn open(&self, options: PortOptions) -> Result<()> {
        {
            let mut state = self.state()?;
            if !matches!(state.status, PortStatus::Closed | PortStatus::Error) {
                return Err(PortError::invalid_state("open", state.status));
            }
            self.check_options(&options)?;
            self.transition(&mut state, PortStatus::Opening);
        }

        if let Err(e) = self.transport.open(&self.info.path, &options).await {
            self.record_failure("open", &e);
            let mut state = self.state()?;
            self.settle(&mut state, PortStatus::Error);
            return Err(e.into());
        }

        let direction = match self.direction_controller(&options) {
            Ok(direction) => direction,
            Err(e) => {
                if let Err(close_err) = self.transport.close().await {
                    warn!("Port {} close after failed open: {}", self.info.id, close_err);
                }
                let mut state = self.state()?;
                state.metrics.errors += 1;
                state.metrics.last_error = Some(e.to_string());
                self.settle(&mut state, PortStatus::Error);
                return Err(e);
            }
        };

        let mut state = self.state()?;
        state.options = Arc::new(options);
        state.direction = direction;
        self.settle(&mut state, PortStatus::Open);
        info!("Port {} opened at {} baud", self.info.id, state.options.baud_rate);
        Ok(())
    }

    /// Write all of `data`.
    ///
    /// Permitted only while `Open`. RS-485 ports switch the transmit-enable
    /// line around the bytes.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let policy = {
            let state = self.state()?;
            if state.status != PortStatus::Open {
                return Err(PortError::invalid_state("write", state.status));
            }
            state.options.write_policy
        };

        let _permit = match policy {
            WritePolicy::Queue => self.write_lock.lock().await,
            WritePolicy::FailFast => self
                .write_lock
                .try_lock()
                .map_err(|_| PortError::Busy(self.info.id.to_string()))?,
        };

        // The port may have closed while this writer was queued
        let direction = {
            let state = self.state()?;
            if state.status != PortStatus::Open {
                return Err(PortError::invalid_state("write", state.status));
            }
            state.direction.clone()
        };

        let sent = match direction {
            Some(dc) => self.send_half_duplex(&dc, data).await,
            None => self.transport.write(data).await,
        };

        if let Err(e) = sent {
            self.record_failure("write", &e);
            return Err(e.into());
        }

        {
            let mut state = self.state()?;
            state.metrics.bytes_written += data.len() as u64;
            state.metrics.writes += 1;
        }
        self.publish(TypedEvent::new(
            "port.written",
            PortEvent::Written {
                port_id: self.info.id.clone(),
                bytes: data.len(),
            },
        ));
        Ok(data.len())
    }

    async fn send_half_duplex(
        &self,
        dc: &DirectionController,
        data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        let guard = dc.begin().await?;
        self.transport.write(data).await?;
        self.transport.drain().await?;
        guard.finish().await
    }

    /// Attach the single reader.
    ///
    /// The returned stream is lazy and not restartable; it ends when the port
    /// leaves `Open` and releases the reader slot when dropped.
    pub fn read(self: &Arc<Self>) -> Result<BoxStream<'static, Result<Bytes>>> {
        self.require_open("read")?;
        if self
            .reader_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PortError::AlreadyReading(self.info.id.to_string()));
        }

        let slot = ReaderSlot { port: self.clone() };
        let chunk = self.capabilities.buffer_size.max(1);

        Ok(stream::unfold(slot, move |slot| async move {
            loop {
                match slot.port.status() {
                    Ok(PortStatus::Open) | Ok(PortStatus::Reconfiguring) => {}
                    _ => return None,
                }

                match slot.port.transport.read(chunk).await {
                    Ok(bytes) if bytes.is_empty() => continue,
                    Ok(bytes) => {
                        if let Ok(mut state) = slot.port.state() {
                            state.metrics.bytes_read += bytes.len() as u64;
                            state.metrics.reads += 1;
                        }
                        return Some((Ok(bytes), slot));
                    }
                    Err(e) => {
                        // A close in progress ends the stream quietly
                        if slot.port.status().ok() != Some(PortStatus::Open) {
                            return None;
                        }
                        slot.port.record_failure("read", &e);
                        return Some((Err(e.into()), slot));
                    }
                }
            }
        })
        .boxed())
    }

    /// Discard transport buffers
    pub async fn flush(&self) -> Result<()> {
        self.require_open("flush")?;
        if let Err(e) = self.transport.flush().await {
            self.record_failure("flush", &e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait for pending output to leave the transmitter
    pub async fn drain(&self) -> Result<()> {
        self.require_open("drain")?;
        let _permit = self.write_lock.lock().await;
        if let Err(e) = self.transport.drain().await {
            self.record_failure("drain", &e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply a partial option update.
    ///
    /// The merged snapshot replaces the current one only if it passes
    /// validation and the transport accepts it; otherwise the previous
    /// snapshot stays in effect and the port returns to `Open`.
    pub async fn update_options(&self, patch: &PortOptionsPatch) -> Result<Arc<PortOptions>> {
        let current = {
            let state = self.state()?;
            if state.status != PortStatus::Open {
                return Err(PortError::invalid_state("update_options", state.status));
            }
            state.options.clone()
        };
        let merged = current.merge(patch);
        self.check_options(&merged)?;

        let _permit = self.write_lock.lock().await;
        {
            let mut state = self.state()?;
            if state.status != PortStatus::Open {
                return Err(PortError::invalid_state("update_options", state.status));
            }
            self.transition(&mut state, PortStatus::Reconfiguring);
        }

        if let Err(e) = self.transport.reconfigure(&merged).await {
            if let Err(restore) = self.transport.reconfigure(&current).await {
                warn!("Port {} could not restore options: {}", self.info.id, restore);
            }
            {
                let mut state = self.state()?;
                state.metrics.errors += 1;
                state.metrics.last_error = Some(e.to_string());
                self.settle(&mut state, PortStatus::Open);
            }
            warn!("Port {} rejected new options: {}", self.info.id, e);
            return Err(e.into());
        }

        let merged = Arc::new(merged);
        let mut state = self.state()?;
        if let (Some(dc), Some((pre, post))) = (
            state.direction.as_ref(),
            merged.effective_timing(&self.capabilities),
        ) {
            dc.retime(pre, post);
        }
        state.options = merged.clone();
        self.settle(&mut state, PortStatus::Open);
        info!("Port {} reconfigured", self.info.id);
        Ok(merged)
    }

    /// Close the port.
    ///
    /// The write in flight, if any, is given the drain timeout to finish;
    /// queued writers then fail with an invalid-state error. The direction
    /// controller is released on every path, once the transmission in
    /// progress has let go of the line.
    pub async fn close(&self) -> Result<()> {
        let drain_timeout = {
            let mut state = self.state()?;
            match state.status {
                PortStatus::Closed => return Ok(()),
                PortStatus::Open | PortStatus::Error | PortStatus::Blocked => {}
                other => return Err(PortError::invalid_state("close", other)),
            }
            state.blocked_from = None;
            self.transition(&mut state, PortStatus::Draining);
            bounded(state.options.drain_timeout())
        };

        let mut outcome: Result<()> = Ok(());
        match tokio::time::timeout(drain_timeout, async {
            let _permit = self.write_lock.lock().await;
            self.transport.drain().await
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(TransportError::NotOpen)) => {}
            Ok(Err(e)) => warn!("Port {} drain before close failed: {}", self.info.id, e),
            Err(_) => {
                warn!("Port {} drain exceeded {:?}", self.info.id, drain_timeout);
                outcome = Err(PortError::Timeout(format!(
                    "drain of {} exceeded {:?}",
                    self.info.id, drain_timeout
                )));
            }
        }

        let direction = {
            let mut state = self.state()?;
            self.transition(&mut state, PortStatus::Closing);
            state.direction.take()
        };

        if let Err(e) = self.transport.close().await {
            warn!("Port {} transport close failed: {}", self.info.id, e);
            if outcome.is_ok() {
                outcome = Err(e.into());
            }
        }

        if let Some(dc) = direction {
            if let Err(e) = dc.release().await {
                warn!("Port {} direction release failed: {}", self.info.id, e);
            }
        }

        let mut state = self.state()?;
        self.transition(&mut state, PortStatus::Closed);
        info!("Port {} closed", self.info.id);
        outcome
    }

    /// Block the port after a security denial
    pub fn block(&self, reason: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.status == PortStatus::Blocked {
            return Ok(());
        }
        state.blocked_from = Some(state.status);
        self.transition(&mut state, PortStatus::Blocked);
        warn!("Port {} blocked: {}", self.info.id, reason);
        Ok(())
    }

    /// Lift a block and restore the state held before it
    pub fn unblock(&self) -> Result<PortStatus> {
        let mut state = self.state()?;
        if state.status != PortStatus::Blocked {
            return Ok(state.status);
        }
        let restored = state.blocked_from.take().unwrap_or(PortStatus::Closed);
        self.transition(&mut state, restored);
        info!("Port {} unblocked", self.info.id);
        Ok(restored)
    }
}

struct ReaderSlot {
    port: Arc<PortStateMachine>,
}

impl Drop for ReaderSlot {
    fn drop(&mut self) {
        self.port.reader_active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::time::Instant;

    use super::*;
    use crate::capability::GpioAccess;
    use crate::mock::{MockGpio, MockTransport};
    use crate::options::Rs485Timing;

    fn plain_port(transport: Arc<MockTransport>) -> PortStateMachine {
        PortStateMachine::new(
            PortInfo::new("COM3", "COM3", PortType::UsbSerial),
            PortCapabilities::default(),
            transport,
            SharedEventBus::new(),
        )
    }

    fn rs485_port(transport: Arc<MockTransport>, gpio: Arc<MockGpio>) -> PortStateMachine {
        let caps = PortCapabilities {
            rs485: Rs485Support::GpioDirection,
            gpio: GpioAccess::Full,
            ..PortCapabilities::default()
        };
        PortStateMachine::new(
            PortInfo::new("bus-a", "/dev/ttyAMA0", PortType::Rs485),
            caps,
            transport,
            SharedEventBus::new(),
        )
        .with_gpio(gpio)
    }

    #[tokio::test]
    async fn test_open_close_round_trip_for_every_supported_baud() -> Result<()> {
        for baud in PortCapabilities::default().supported_baud_rates {
            let transport = Arc::new(MockTransport::new());
            let port = plain_port(transport.clone());

            port.open(PortOptions::new(baud)).await?;
            assert_eq!(port.status()?, PortStatus::Open);
            assert_eq!(transport.options().map(|o| o.baud_rate), Some(baud));

            port.close().await?;
            assert_eq!(port.status()?, PortStatus::Closed);
            assert_eq!(port.metrics()?.errors, 0);
            assert!(!transport.is_open());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_configuration_mismatch_leaves_state_unchanged() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        let port = plain_port(transport.clone());

        let err = tokio_test::assert_err!(port.open(PortOptions::new(31337)).await);
        assert!(matches!(err, PortError::Configuration(_)));
        assert_eq!(port.status()?, PortStatus::Closed);
        assert_eq!(transport.open_count(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_transport_failure_moves_to_error_and_reopens() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        let port = plain_port(transport.clone());
        let mut events = port.subscribe()?;

        transport.fail_next_open(TransportError::PermissionDenied("COM3".into()));
        assert!(matches!(
            port.open(PortOptions::default()).await,
            Err(PortError::Transport(TransportError::PermissionDenied(_)))
        ));
        assert_eq!(port.status()?, PortStatus::Error);

        let mut saw_error = false;
        while let Some(event) = events.try_recv() {
            if matches!(event.payload, PortEvent::Error { operation: "open", .. }) {
                assert!(event.is_urgent());
                saw_error = true;
            }
        }
        assert!(saw_error);

        port.open(PortOptions::default()).await?;
        assert_eq!(port.status()?, PortStatus::Open);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_requires_open() {
        let port = plain_port(Arc::new(MockTransport::new()));
        assert!(matches!(
            port.write(b"x").await,
            Err(PortError::InvalidState {
                operation: "write",
                status: PortStatus::Closed
            })
        ));
    }

    #[tokio::test]
    async fn test_transient_write_failure_keeps_port_open() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        let port = plain_port(transport.clone());
        port.open(PortOptions::default()).await?;

        transport.fail_next_write(TransportError::WouldBlock("tx full".into()));
        assert!(port.write(b"a").await.is_err());
        assert_eq!(port.status()?, PortStatus::Open);

        transport.fail_next_write(TransportError::Io("unplugged".into()));
        assert!(port.write(b"b").await.is_err());
        assert_eq!(port.status()?, PortStatus::Error);
        assert_eq!(port.metrics()?.errors, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_rs485_transmit_enable_brackets_every_write() -> Result<()> {
        let gpio = Arc::new(MockGpio::new());
        let transport = Arc::new(MockTransport::new().observing(gpio.clone()));
        let port = rs485_port(transport.clone(), gpio.clone());

        let post = Duration::from_millis(3);
        let options = PortOptions::new(19200)
            .with_rs485(Rs485Timing::new(Duration::from_millis(2), post));
        port.open(options).await?;

        for frame in [&b"\x01\x03\x00\x00"[..], b"\x02\x06", b"\x03"] {
            port.write(frame).await?;
        }
        port.close().await?;

        let writes = transport.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.tx_enable == Some(true)));

        // Skip the initial deassert made when the line was set up
        let toggles: Vec<(Instant, bool)> = gpio.transitions().into_iter().skip(1).collect();
        for (i, write) in writes.iter().enumerate() {
            let (asserted_at, high) = toggles[2 * i];
            let (deasserted_at, low) = toggles[2 * i + 1];
            assert!(high && !low);
            assert!(asserted_at < write.at);
            assert!(deasserted_at >= write.at + post);
        }
        assert!(!gpio.level());
        assert!(!gpio.is_exported());
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_timeout_keeps_line_until_transmission_ends() -> Result<()> {
        let gpio = Arc::new(MockGpio::new());
        let transport = Arc::new(MockTransport::new().observing(gpio.clone()));
        transport.set_write_delay(Duration::from_millis(400));
        let port = Arc::new(rs485_port(transport.clone(), gpio.clone()));
        port.open(PortOptions {
            drain_timeout_ms: 50,
            ..PortOptions::new(19200).with_rs485(Rs485Timing::default())
        })
        .await?;

        let writer = {
            let port = port.clone();
            tokio::spawn(async move { port.write(b"long frame").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let closing = {
            let port = port.clone();
            tokio::spawn(async move { port.close().await })
        };

        // Past the drain timeout, but the frame is still on the wire
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!closing.is_finished());
        assert!(gpio.level());
        assert!(gpio.is_exported());

        let closed = closing.await.map_err(|e| CoreError::runtime(e.to_string()))?;
        assert!(matches!(closed, Err(PortError::Timeout(_))));
        assert!(!gpio.level());
        assert!(!gpio.is_exported());
        assert_eq!(port.status()?, PortStatus::Closed);

        // The frame went out whole; only the drain after it saw the close
        assert!(writer.await.map_err(|e| CoreError::runtime(e.to_string()))?.is_err());
        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].tx_enable, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_rs485_without_gpio_line_is_a_configuration_error() {
        let caps = PortCapabilities {
            rs485: Rs485Support::GpioDirection,
            ..PortCapabilities::default()
        };
        let port = PortStateMachine::new(
            PortInfo::new("bus-b", "/dev/ttyS1", PortType::Rs485),
            caps,
            Arc::new(MockTransport::new()),
            SharedEventBus::new(),
        );
        let options = PortOptions::new(9600).with_rs485(Rs485Timing::default());
        assert!(matches!(
            port.open(options).await,
            Err(PortError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_serialize_in_submission_order() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        transport.set_write_delay(Duration::from_millis(2));
        let port = Arc::new(plain_port(transport.clone()));
        port.open(PortOptions::default()).await?;

        let mut handles = Vec::new();
        let mut expected = Vec::new();
        for i in 0..8u8 {
            let frame = vec![i; 4];
            expected.extend_from_slice(&frame);
            let port = port.clone();
            handles.push(tokio::spawn(async move { port.write(&frame).await }));
            // Let the task reach the write queue before the next one is spawned
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.map_err(|e| CoreError::runtime(e.to_string()))??;
        }

        assert_eq!(transport.written_bytes(), expected);
        assert_eq!(transport.max_concurrent_writes(), 1);
        assert_eq!(port.metrics()?.writes, 8);
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_fast_policy_reports_busy() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        transport.set_write_delay(Duration::from_millis(50));
        let port = Arc::new(plain_port(transport.clone()));
        port.open(PortOptions::default().with_write_policy(WritePolicy::FailFast))
            .await?;

        let first = {
            let port = port.clone();
            tokio::spawn(async move { port.write(b"slow").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(port.write(b"fast").await, Err(PortError::Busy(_))));
        first.await.map_err(|e| CoreError::runtime(e.to_string()))??;
        Ok(())
    }

    #[tokio::test]
    async fn test_close_fails_queued_writers() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        transport.set_write_delay(Duration::from_millis(30));
        let port = Arc::new(plain_port(transport.clone()));
        port.open(PortOptions::default()).await?;

        let in_flight = {
            let port = port.clone();
            tokio::spawn(async move { port.write(b"first").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let queued = {
            let port = port.clone();
            tokio::spawn(async move { port.write(b"second").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        port.close().await?;

        assert!(in_flight.await.map_err(|e| CoreError::runtime(e.to_string()))?.is_ok());
        assert!(matches!(
            queued.await.map_err(|e| CoreError::runtime(e.to_string()))?,
            Err(PortError::InvalidState { operation: "write", .. })
        ));
        assert_eq!(transport.written_bytes(), b"first".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_single_reader_and_slot_release() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        let port = Arc::new(plain_port(transport.clone()));
        port.open(PortOptions::default()).await?;

        let mut reader = port.read()?;
        assert!(matches!(port.read(), Err(PortError::AlreadyReading(_))));

        transport.push_incoming(&b"ping"[..]);
        let chunk = reader.next().await;
        assert!(matches!(chunk, Some(Ok(ref b)) if &b[..] == b"ping"));
        assert_eq!(port.metrics()?.bytes_read, 4);

        drop(reader);
        assert!(!port.is_reading());
        let reader = port.read()?;

        port.close().await?;
        let rest: Vec<_> = reader.collect().await;
        assert!(rest.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_options_commits_or_rolls_back() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        let port = plain_port(transport.clone());
        port.open(PortOptions::new(9600)).await?;

        let updated = port.update_options(&PortOptionsPatch::baud_rate(115200)).await?;
        assert_eq!(updated.baud_rate, 115200);
        assert_eq!(port.status()?, PortStatus::Open);

        assert!(matches!(
            port.update_options(&PortOptionsPatch::baud_rate(1234)).await,
            Err(PortError::Configuration(_))
        ));
        assert_eq!(port.options()?.baud_rate, 115200);

        transport.reject_reconfigure(true);
        assert!(port.update_options(&PortOptionsPatch::baud_rate(57600)).await.is_err());
        assert_eq!(port.options()?.baud_rate, 115200);
        assert_eq!(port.status()?, PortStatus::Open);
        Ok(())
    }

    #[tokio::test]
    async fn test_block_remembers_prior_state() -> Result<()> {
        let port = plain_port(Arc::new(MockTransport::new()));
        port.open(PortOptions::default()).await?;

        port.block("rate limit exceeded")?;
        assert_eq!(port.status()?, PortStatus::Blocked);
        assert!(port.write(b"x").await.is_err());
        assert!(port.open(PortOptions::default()).await.is_err());

        assert_eq!(port.unblock()?, PortStatus::Open);
        port.write(b"x").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_flush_and_drain() -> Result<()> {
        let transport = Arc::new(MockTransport::new());
        let port = plain_port(transport.clone());
        assert!(port.flush().await.is_err());

        port.open(PortOptions::default()).await?;
        port.flush().await?;
        port.drain().await?;
        assert_eq!(transport.flush_count(), 1);
        assert_eq!(transport.drain_count(), 1);
        Ok(())
    }
}
