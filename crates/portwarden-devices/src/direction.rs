/*!
 * RS-485 half-duplex direction control.
 *
 * A [`DirectionController`] owns the transmit-enable line of exactly one
 * port. Every transmission goes through a [`TransmitGuard`]:
 *
 * ```text
 * assert TX-enable → pre-send guard → write → drain → post-send guard → deassert
 * ```
 *
 * The guard deasserts on drop, so an error or a cancelled future between
 * `begin` and `finish` still returns the bus to receive mode. Releasing the
 * controller waits for the transmission in progress, so the line is never
 * torn down under a writer.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, warn};

use portwarden_core::types::Id;

use crate::error::TransportError;
use crate::transport::{GpioDirection, GpioLine, TransportResult};

/// How the transmit direction is switched
#[derive(Debug, Clone)]
pub enum DirectionMode {
    /// The driver switches direction itself; only guard delays apply
    Native,
    /// A GPIO transmit-enable line is driven around each send
    Gpio(Arc<dyn GpioLine>),
}

/// Transmit-enable controller for one RS-485 port
#[derive(Debug)]
pub struct DirectionController {
    port_id: Id,
    mode: DirectionMode,
    timing: Mutex<(Duration, Duration)>,
    lock: AsyncMutex<()>,
    released: AtomicBool,
}

impl DirectionController {
    /// Create a controller and put the line into receive mode
    pub fn new(
        port_id: Id,
        mode: DirectionMode,
        pre_send: Duration,
        post_send: Duration,
    ) -> TransportResult<Self> {
        if let DirectionMode::Gpio(line) = &mode {
            line.set_direction(GpioDirection::Output)?;
            line.write(false)?;
        }
        debug!(
            "Direction controller for {} ready (pre {:?}, post {:?})",
            port_id, pre_send, post_send
        );
        Ok(Self {
            port_id,
            mode,
            timing: Mutex::new((pre_send, post_send)),
            lock: AsyncMutex::new(()),
            released: AtomicBool::new(false),
        })
    }

    /// Port this controller belongs to
    pub fn port_id(&self) -> &Id {
        &self.port_id
    }

    /// Current (pre-send, post-send) guard delays
    pub fn timing(&self) -> (Duration, Duration) {
        *self.timing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the guard delays; takes effect on the next transmission
    pub fn retime(&self, pre_send: Duration, post_send: Duration) {
        *self.timing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = (pre_send, post_send);
    }

    /// Whether transmit-enable is currently driven high
    pub fn is_asserted(&self) -> bool {
        match &self.mode {
            DirectionMode::Gpio(line) => line.read().unwrap_or(false),
            DirectionMode::Native => false,
        }
    }

    /// Whether [`release`](Self::release) has run
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Assert transmit-enable and wait out the pre-send guard
    pub async fn begin(&self) -> TransportResult<TransmitGuard<'_>> {
        let held = self.lock.lock().await;
        if self.is_released() {
            return Err(TransportError::NotOpen);
        }

        let (pre_send, post_send) = self.timing();
        let line = match &self.mode {
            DirectionMode::Gpio(line) => {
                line.write(true)?;
                Some(line.clone())
            }
            DirectionMode::Native => None,
        };

        let guard = TransmitGuard {
            _held: held,
            line,
            post_send,
            port_id: &self.port_id,
            done: false,
        };

        if !pre_send.is_zero() {
            tokio::time::sleep(pre_send).await;
        }
        Ok(guard)
    }

    /// Wait for the transmission in progress, then deassert, return the
    /// line to input and unexport it.
    ///
    /// Idempotent. Later calls to [`begin`](Self::begin) fail.
    pub async fn release(&self) -> TransportResult<()> {
        let _held = self.lock.lock().await;
        self.release_line()
    }

    fn release_line(&self) -> TransportResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let DirectionMode::Gpio(line) = &self.mode {
            let deasserted = line.write(false);
            let direction = line.set_direction(GpioDirection::Input);
            let unexported = line.unexport();
            debug!("Released transmit-enable line of {}", self.port_id);
            deasserted.and(direction).and(unexported)?;
        }
        Ok(())
    }
}

impl Drop for DirectionController {
    fn drop(&mut self) {
        // No guard can outlive the controller it borrows
        if let Err(e) = self.release_line() {
            warn!("Failed to release transmit-enable of {}: {}", self.port_id, e);
        }
    }
}

/// An in-progress transmission holding the transmit-enable line
#[derive(Debug)]
pub struct TransmitGuard<'a> {
    _held: AsyncMutexGuard<'a, ()>,
    line: Option<Arc<dyn GpioLine>>,
    post_send: Duration,
    port_id: &'a Id,
    done: bool,
}

impl TransmitGuard<'_> {
    /// Wait out the post-send guard, then deassert
    pub async fn finish(mut self) -> TransportResult<()> {
        if !self.post_send.is_zero() {
            tokio::time::sleep(self.post_send).await;
        }
        self.done = true;
        match &self.line {
            Some(line) => line.write(false),
            None => Ok(()),
        }
    }
}

impl Drop for TransmitGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(line) = &self.line {
            if let Err(e) = line.write(false) {
                warn!("Failed to deassert transmit-enable of {}: {}", self.port_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGpio;

    fn controller(gpio: &Arc<MockGpio>, pre: u64, post: u64) -> DirectionController {
        DirectionController::new(
            "bus0".into(),
            DirectionMode::Gpio(gpio.clone()),
            Duration::from_millis(pre),
            Duration::from_millis(post),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_guard_asserts_then_deasserts_after_post_delay() {
        let gpio = Arc::new(MockGpio::new());
        let dc = controller(&gpio, 2, 3);
        assert!(gpio.is_output());
        assert!(!dc.is_asserted());

        let guard = dc.begin().await.unwrap();
        assert!(dc.is_asserted());
        let finishing = tokio::time::Instant::now();
        guard.finish().await.unwrap();
        assert!(finishing.elapsed() >= Duration::from_millis(3));
        assert!(!gpio.level());

        let levels: Vec<bool> = gpio.transitions().iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_dropped_guard_deasserts() {
        let gpio = Arc::new(MockGpio::new());
        let dc = controller(&gpio, 0, 50);
        {
            let _guard = dc.begin().await.unwrap();
            assert!(gpio.level());
        }
        assert!(!gpio.level());
    }

    #[tokio::test]
    async fn test_release_is_final() {
        let gpio = Arc::new(MockGpio::new());
        let dc = controller(&gpio, 0, 0);
        dc.release().await.unwrap();
        dc.release().await.unwrap();

        assert!(!gpio.is_exported());
        assert!(!gpio.is_output());
        assert!(dc.begin().await.is_err());
    }

    #[tokio::test]
    async fn test_release_waits_for_transmission() {
        let gpio = Arc::new(MockGpio::new());
        let dc = Arc::new(controller(&gpio, 0, 40));

        let guard = dc.begin().await.unwrap();
        let releasing = {
            let dc = dc.clone();
            tokio::spawn(async move { dc.release().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!releasing.is_finished());
        assert!(gpio.level());
        assert!(gpio.is_exported());

        guard.finish().await.unwrap();
        releasing.await.unwrap().unwrap();
        assert!(!gpio.level());
        assert!(!gpio.is_exported());

        let levels: Vec<bool> = gpio.transitions().iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![false, true, false, false]);
    }

    #[tokio::test]
    async fn test_native_mode_only_applies_delays() {
        let dc = DirectionController::new(
            "bus1".into(),
            DirectionMode::Native,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .unwrap();
        dc.retime(Duration::ZERO, Duration::from_millis(2));
        assert_eq!(dc.timing(), (Duration::ZERO, Duration::from_millis(2)));

        let guard = dc.begin().await.unwrap();
        assert!(!dc.is_asserted());
        guard.finish().await.unwrap();
    }
}
