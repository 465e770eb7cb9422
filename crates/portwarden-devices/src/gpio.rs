/*!
 * `rppal`-backed transmit-enable line for Raspberry Pi class boards.
 */
use std::sync::Mutex;

use rppal::gpio::{Gpio, IoPin, Level, Mode};

use crate::error::TransportError;
use crate::transport::{GpioDirection, GpioLine, TransportResult};

impl From<rppal::gpio::Error> for TransportError {
    fn from(err: rppal::gpio::Error) -> Self {
        match err {
            rppal::gpio::Error::PermissionDenied(path) => TransportError::PermissionDenied(path),
            rppal::gpio::Error::PinNotAvailable(pin) => {
                TransportError::NotFound(format!("GPIO {}", pin))
            }
            rppal::gpio::Error::Io(e) => e.into(),
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// A BCM-numbered GPIO pin
#[derive(Debug)]
pub struct RppalLine {
    bcm: u8,
    pin: Mutex<Option<IoPin>>,
}

impl RppalLine {
    /// Claim the pin as a low output
    pub fn new(bcm: u8) -> TransportResult<Self> {
        let mut pin = Gpio::new()?.get(bcm)?.into_io(Mode::Output);
        pin.set_low();
        Ok(Self {
            bcm,
            pin: Mutex::new(Some(pin)),
        })
    }

    /// BCM pin number
    pub fn bcm(&self) -> u8 {
        self.bcm
    }

    fn with_pin<T>(&self, op: impl FnOnce(&mut IoPin) -> T) -> TransportResult<T> {
        let mut guard = self
            .pin
            .lock()
            .map_err(|_| TransportError::Io(format!("GPIO {} lock poisoned", self.bcm)))?;
        guard.as_mut().map(op).ok_or(TransportError::NotOpen)
    }
}

impl GpioLine for RppalLine {
    fn write(&self, high: bool) -> TransportResult<()> {
        self.with_pin(|pin| pin.write(if high { Level::High } else { Level::Low }))
    }

    fn read(&self) -> TransportResult<bool> {
        self.with_pin(|pin| pin.read() == Level::High)
    }

    fn set_direction(&self, direction: GpioDirection) -> TransportResult<()> {
        let mode = match direction {
            GpioDirection::Input => Mode::Input,
            GpioDirection::Output => Mode::Output,
        };
        self.with_pin(|pin| pin.set_mode(mode))
    }

    fn unexport(&self) -> TransportResult<()> {
        // Dropping the pin resets it to its original mode
        self.pin
            .lock()
            .map_err(|_| TransportError::Io(format!("GPIO {} lock poisoned", self.bcm)))?
            .take();
        Ok(())
    }
}
