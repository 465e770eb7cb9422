/*!
 * In-memory transport and GPIO line.
 *
 * Both record what happened and when, so tests can check write ordering and
 * RS-485 transmit-enable timing without hardware. Failures can be injected
 * per call.
 */
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::options::PortOptions;
use crate::transport::{GpioDirection, GpioLine, SerialTransport, TransportResult};

/// One write observed by a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct WriteRecord {
    /// When the bytes reached the transport
    pub at: Instant,
    /// The bytes written
    pub data: Bytes,
    /// Transmit-enable level at that moment, if a GPIO line is observed
    pub tx_enable: Option<bool>,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    path: Option<String>,
    options: Option<PortOptions>,
    writes: Vec<WriteRecord>,
    incoming: VecDeque<Bytes>,
    opens: usize,
    closes: usize,
    flushes: usize,
    drains: usize,
    fail_open: Option<TransportError>,
    fail_every_open: Option<TransportError>,
    fail_writes: VecDeque<TransportError>,
    reject_reconfigure: bool,
    write_delay: Duration,
}

/// Serial transport backed by memory
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    readable: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    observed: Option<Arc<MockGpio>>,
}

impl MockTransport {
    /// Create a closed mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the level of `gpio` alongside every write
    pub fn observing(mut self, gpio: Arc<MockGpio>) -> Self {
        self.observed = Some(gpio);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means a test panicked mid-call
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next open fail
    pub fn fail_next_open(&self, err: TransportError) {
        self.state().fail_open = Some(err);
    }

    /// Fail every open with `err` until called again with `None`
    pub fn fail_opens(&self, err: Option<TransportError>) {
        self.state().fail_every_open = err;
    }

    /// Make the next write fail
    pub fn fail_next_write(&self, err: TransportError) {
        self.state().fail_writes.push_back(err);
    }

    /// Reject every reconfigure call while set
    pub fn reject_reconfigure(&self, reject: bool) {
        self.state().reject_reconfigure = reject;
    }

    /// Time each write spends in flight
    pub fn set_write_delay(&self, delay: Duration) {
        self.state().write_delay = delay;
    }

    /// Queue bytes for the reader
    pub fn push_incoming<B: Into<Bytes>>(&self, data: B) {
        self.state().incoming.push_back(data.into());
        self.readable.notify_one();
    }

    /// Simulate the device vanishing
    pub fn disconnect(&self) {
        self.state().open = false;
        self.readable.notify_one();
    }

    /// Every write observed so far
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    /// Concatenation of every write observed so far
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state()
            .writes
            .iter()
            .flat_map(|w| w.data.iter().copied())
            .collect()
    }

    /// Whether the transport is open
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Options applied by the last open or reconfigure
    pub fn options(&self) -> Option<PortOptions> {
        self.state().options.clone()
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// Number of closes
    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    /// Number of flushes
    pub fn flush_count(&self) -> usize {
        self.state().flushes
    }

    /// Number of drains
    pub fn drain_count(&self) -> usize {
        self.state().drains
    }

    /// Highest number of writes ever in flight at once
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SerialTransport for MockTransport {
    async fn open(&self, path: &str, options: &PortOptions) -> TransportResult<()> {
        let mut state = self.state();
        if let Some(err) = state.fail_open.take().or_else(|| state.fail_every_open.clone()) {
            return Err(err);
        }
        state.open = true;
        state.path = Some(path.to_string());
        state.options = Some(options.clone());
        state.opens += 1;
        Ok(())
    }

    async fn read(&self, max_len: usize) -> TransportResult<Bytes> {
        loop {
            {
                let mut state = self.state();
                if !state.open {
                    return Err(TransportError::NotOpen);
                }
                if let Some(mut chunk) = state.incoming.pop_front() {
                    if chunk.len() > max_len {
                        let rest = chunk.split_off(max_len);
                        state.incoming.push_front(rest);
                    }
                    return Ok(chunk);
                }
            }
            self.readable.notified().await;
        }
    }

    async fn write(&self, data: &[u8]) -> TransportResult<()> {
        let delay = {
            let mut state = self.state();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            if let Some(err) = state.fail_writes.pop_front() {
                return Err(err);
            }
            state.write_delay
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let record = WriteRecord {
            at: Instant::now(),
            data: Bytes::copy_from_slice(data),
            tx_enable: self.observed.as_ref().map(|gpio| gpio.level()),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state().writes.push(record);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drain(&self) -> TransportResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.drains += 1;
        Ok(())
    }

    async fn flush(&self) -> TransportResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.incoming.clear();
        state.flushes += 1;
        Ok(())
    }

    async fn reconfigure(&self, options: &PortOptions) -> TransportResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.reject_reconfigure {
            return Err(TransportError::Unsupported(format!(
                "baud rate {}",
                options.baud_rate
            )));
        }
        state.options = Some(options.clone());
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        {
            let mut state = self.state();
            state.open = false;
            state.closes += 1;
        }
        self.readable.notify_one();
        Ok(())
    }
}

/// GPIO line backed by memory
#[derive(Debug)]
pub struct MockGpio {
    level: AtomicBool,
    output: AtomicBool,
    exported: AtomicBool,
    fail_writes: AtomicBool,
    log: Mutex<Vec<(Instant, bool)>>,
}

impl MockGpio {
    /// Create an exported line held low
    pub fn new() -> Self {
        Self {
            level: AtomicBool::new(false),
            output: AtomicBool::new(false),
            exported: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Current level
    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    /// Whether the line is configured as an output
    pub fn is_output(&self) -> bool {
        self.output.load(Ordering::SeqCst)
    }

    /// Whether the line is still exported
    pub fn is_exported(&self) -> bool {
        self.exported.load(Ordering::SeqCst)
    }

    /// Make writes fail while set
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every level change with its timestamp
    pub fn transitions(&self) -> Vec<(Instant, bool)> {
        self.log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Default for MockGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioLine for MockGpio {
    fn write(&self, high: bool) -> TransportResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("gpio write failed".to_string()));
        }
        if !self.is_exported() {
            return Err(TransportError::NotOpen);
        }
        self.level.store(high, Ordering::SeqCst);
        let mut log = self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        log.push((Instant::now(), high));
        Ok(())
    }

    fn read(&self) -> TransportResult<bool> {
        Ok(self.level())
    }

    fn set_direction(&self, direction: GpioDirection) -> TransportResult<()> {
        if !self.is_exported() {
            return Err(TransportError::NotOpen);
        }
        self.output
            .store(direction == GpioDirection::Output, Ordering::SeqCst);
        Ok(())
    }

    fn unexport(&self) -> TransportResult<()> {
        self.exported.store(false, Ordering::SeqCst);
        Ok(())
    }
}
