/*!
 * Port option snapshots.
 *
 * `PortOptions` is an immutable value: ports hold it behind an `Arc` and
 * replace the whole snapshot on reconfiguration. Partial updates are
 * expressed as a [`PortOptionsPatch`] merged onto the current snapshot.
 */
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::{PortCapabilities, Rs485Support};
use crate::error::{PortError, Result};
use crate::port::PortType;

/// Upper bound accepted for a single RS-485 guard delay
pub const MAX_GUARD_DELAY: Duration = Duration::from_millis(100);

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    Eight,
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit
    One,
    /// Two stop bits
    Two,
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// What a writer does when another write is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Wait in FIFO order
    #[default]
    Queue,
    /// Fail immediately with a busy error
    FailFast,
}

/// RS-485 half-duplex timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rs485Timing {
    /// Delay between asserting transmit-enable and the first byte, in microseconds
    pub pre_send_delay_us: u64,
    /// Delay between the drained last byte and deasserting, in microseconds
    pub post_send_delay_us: u64,
    /// Shared bus this port transmits on, if any
    #[serde(default)]
    pub bus: Option<String>,
}

impl Rs485Timing {
    /// Timing with the given guard delays on a private bus
    pub fn new(pre_send: Duration, post_send: Duration) -> Self {
        Self {
            pre_send_delay_us: u64::try_from(pre_send.as_micros()).unwrap_or(u64::MAX),
            post_send_delay_us: u64::try_from(post_send.as_micros()).unwrap_or(u64::MAX),
            bus: None,
        }
    }

    /// Attach the port to a shared bus
    pub fn on_bus<S: Into<String>>(mut self, bus: S) -> Self {
        self.bus = Some(bus.into());
        self
    }

    /// Pre-send guard delay
    pub fn pre_send_delay(&self) -> Duration {
        Duration::from_micros(self.pre_send_delay_us)
    }

    /// Post-send guard delay
    pub fn post_send_delay(&self) -> Duration {
        Duration::from_micros(self.post_send_delay_us)
    }
}

impl Default for Rs485Timing {
    fn default() -> Self {
        Self::new(Duration::from_micros(500), Duration::from_micros(500))
    }
}

/// Immutable configuration snapshot of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOptions {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
    /// RS-485 timing; required on RS-485 ports and rejected elsewhere
    #[serde(default)]
    pub rs485: Option<Rs485Timing>,
    /// Behavior of concurrent writers
    #[serde(default)]
    pub write_policy: WritePolicy,
    /// Bound on draining pending writes during close, in milliseconds
    pub drain_timeout_ms: u64,
}

impl PortOptions {
    /// 8N1 at the given baud rate
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    /// Set RS-485 timing
    pub fn with_rs485(mut self, timing: Rs485Timing) -> Self {
        self.rs485 = Some(timing);
        self
    }

    /// Set the write policy
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Drain bound as a duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Build a new snapshot with the patch applied
    pub fn merge(&self, patch: &PortOptionsPatch) -> PortOptions {
        PortOptions {
            baud_rate: patch.baud_rate.unwrap_or(self.baud_rate),
            data_bits: patch.data_bits.unwrap_or(self.data_bits),
            parity: patch.parity.unwrap_or(self.parity),
            stop_bits: patch.stop_bits.unwrap_or(self.stop_bits),
            flow_control: patch.flow_control.unwrap_or(self.flow_control),
            rs485: match &patch.rs485 {
                Some(timing) => timing.clone(),
                None => self.rs485.clone(),
            },
            write_policy: patch.write_policy.unwrap_or(self.write_policy),
            drain_timeout_ms: patch.drain_timeout_ms.unwrap_or(self.drain_timeout_ms),
        }
    }

    /// Check the snapshot against a port's type and capabilities
    pub fn validate(&self, port_type: PortType, caps: &PortCapabilities) -> Result<()> {
        if !caps.supports_baud(self.baud_rate) {
            return Err(PortError::configuration(format!(
                "Baud rate {} is not supported",
                self.baud_rate
            )));
        }

        if self.flow_control == FlowControl::Hardware && !caps.hardware_flow_control {
            return Err(PortError::configuration(
                "Hardware flow control is not available on this port",
            ));
        }

        if self.drain_timeout_ms == 0 {
            return Err(PortError::configuration("Drain timeout must be positive"));
        }

        match (port_type, &self.rs485) {
            (PortType::Rs485, None) => {
                return Err(PortError::configuration("RS-485 port requires RS-485 timing"));
            }
            (PortType::Rs485, Some(timing)) => {
                if caps.rs485 == Rs485Support::Unsupported {
                    return Err(PortError::configuration(
                        "RS-485 is not supported on this port or platform",
                    ));
                }
                if self.flow_control == FlowControl::Hardware {
                    return Err(PortError::configuration(
                        "Hardware flow control conflicts with RS-485 direction control",
                    ));
                }
                if timing.pre_send_delay() > MAX_GUARD_DELAY
                    || timing.post_send_delay() > MAX_GUARD_DELAY
                {
                    return Err(PortError::configuration(format!(
                        "RS-485 guard delays must not exceed {:?}",
                        MAX_GUARD_DELAY
                    )));
                }
            }
            (_, Some(_)) => {
                return Err(PortError::configuration(format!(
                    "RS-485 timing given for a {:?} port",
                    port_type
                )));
            }
            (_, None) => {}
        }

        Ok(())
    }

    /// RS-485 timing with guard delays rounded up to the timer precision
    pub fn effective_timing(&self, caps: &PortCapabilities) -> Option<(Duration, Duration)> {
        self.rs485.as_ref().map(|timing| {
            (
                caps.timing_precision.round_up(timing.pre_send_delay()),
                caps.timing_precision.round_up(timing.post_send_delay()),
            )
        })
    }
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            rs485: None,
            write_policy: WritePolicy::Queue,
            drain_timeout_ms: 1_000,
        }
    }
}

/// Partial update for a [`PortOptions`] snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOptionsPatch {
    /// New baud rate
    pub baud_rate: Option<u32>,
    /// New data bits
    pub data_bits: Option<DataBits>,
    /// New parity
    pub parity: Option<Parity>,
    /// New stop bits
    pub stop_bits: Option<StopBits>,
    /// New flow control
    pub flow_control: Option<FlowControl>,
    /// `Some(None)` removes RS-485 timing, `Some(Some(..))` replaces it
    pub rs485: Option<Option<Rs485Timing>>,
    /// New write policy
    pub write_policy: Option<WritePolicy>,
    /// New drain bound in milliseconds
    pub drain_timeout_ms: Option<u64>,
}

impl PortOptionsPatch {
    /// Patch changing only the baud rate
    pub fn baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate: Some(baud_rate),
            ..Self::default()
        }
    }

    /// Whether the patch changes nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
