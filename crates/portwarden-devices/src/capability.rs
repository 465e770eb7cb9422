/*!
 * Platform and port capability descriptors.
 *
 * Capabilities come from an external provider (platform fingerprinting is
 * not done here). They are closed enums so every consumer matches them
 * exhaustively, with an explicit generic/unknown fallback for platforms the
 * provider cannot classify.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operating platform family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformKind {
    /// Desktop or server Linux
    Linux,
    /// Windows
    Windows,
    /// macOS
    MacOs,
    /// Raspberry Pi class single-board computer
    RaspberryPi,
    /// Anything the provider could not classify
    Generic,
}

/// Virtualization layer the process runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Virtualization {
    /// No virtualization detected
    BareMetal,
    /// Container runtime
    Container,
    /// Full virtual machine
    VirtualMachine,
    /// Windows Subsystem for Linux
    Wsl,
    /// Detection was inconclusive
    Unknown,
}

/// How much GPIO control the process has
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpioAccess {
    /// No GPIO access
    Unavailable,
    /// Lines can be driven but not exported or re-directed
    Restricted,
    /// Full control
    Full,
}

/// RS-485 support offered for a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rs485Support {
    /// Half-duplex operation is not possible
    Unsupported,
    /// The driver switches direction itself
    Native,
    /// Direction is switched through a GPIO transmit-enable line
    GpioDirection,
}

/// Resolution of the timers available for guard delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimingPrecision {
    /// Microsecond timers
    Microsecond,
    /// Millisecond timers
    Millisecond,
    /// Scheduler-tick resolution only
    Coarse,
}

impl TimingPrecision {
    /// Smallest delay the platform can honor
    pub fn granularity(&self) -> Duration {
        match self {
            TimingPrecision::Microsecond => Duration::from_micros(1),
            TimingPrecision::Millisecond => Duration::from_millis(1),
            TimingPrecision::Coarse => Duration::from_millis(10),
        }
    }

    /// Round a delay up to the next multiple of the granularity
    pub fn round_up(&self, delay: Duration) -> Duration {
        let step = self.granularity().as_nanos();
        let nanos = delay.as_nanos();
        if nanos == 0 {
            return Duration::ZERO;
        }
        let steps = (nanos + step - 1) / step;
        Duration::from_nanos(u64::try_from(steps * step).unwrap_or(u64::MAX))
    }
}

/// Platform descriptor supplied by the capability provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Platform family
    pub kind: PlatformKind,
    /// Virtualization layer
    pub virtualization: Virtualization,
    /// Platform-wide GPIO access
    pub gpio: GpioAccess,
}

impl PlatformInfo {
    /// Whether capabilities should be degraded on this platform
    pub fn is_restricted(&self) -> bool {
        !matches!(self.virtualization, Virtualization::BareMetal) || self.gpio != GpioAccess::Full
    }
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            kind: PlatformKind::Generic,
            virtualization: Virtualization::Unknown,
            gpio: GpioAccess::Unavailable,
        }
    }
}

/// Capability descriptor for one port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCapabilities {
    /// Baud rates the port accepts
    pub supported_baud_rates: Vec<u32>,
    /// RS-485 support
    pub rs485: Rs485Support,
    /// Timer resolution for guard delays
    pub timing_precision: TimingPrecision,
    /// Driver buffer size in bytes
    pub buffer_size: usize,
    /// GPIO access for this port's transmit-enable line
    pub gpio: GpioAccess,
    /// Whether RTS/CTS flow control is available
    pub hardware_flow_control: bool,
}

impl PortCapabilities {
    /// Whether the baud rate is advertised
    pub fn supports_baud(&self, baud: u32) -> bool {
        self.supported_baud_rates.contains(&baud)
    }

    /// Degrade the descriptor to what the platform actually allows.
    ///
    /// GPIO access is capped by the platform; GPIO-switched RS-485 becomes
    /// unsupported without usable GPIO; timers under any virtualization layer
    /// are no finer than a millisecond.
    pub fn restricted_by(&self, platform: &PlatformInfo) -> PortCapabilities {
        let mut caps = self.clone();
        caps.gpio = caps.gpio.min(platform.gpio);

        if caps.rs485 == Rs485Support::GpioDirection && caps.gpio == GpioAccess::Unavailable {
            caps.rs485 = Rs485Support::Unsupported;
        }

        if !matches!(platform.virtualization, Virtualization::BareMetal) {
            caps.timing_precision = caps.timing_precision.max(TimingPrecision::Millisecond);
        }

        caps
    }
}

impl Default for PortCapabilities {
    fn default() -> Self {
        Self {
            supported_baud_rates: vec![
                1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
            ],
            rs485: Rs485Support::Unsupported,
            timing_precision: TimingPrecision::Millisecond,
            buffer_size: 4096,
            gpio: GpioAccess::Unavailable,
            hardware_flow_control: true,
        }
    }
}

/// Source of platform and per-port capability descriptors
pub trait CapabilityProvider: Send + Sync + Debug {
    /// Platform descriptor
    fn platform(&self) -> PlatformInfo;

    /// Raw capabilities of the port at `path`, if the port is known
    fn port_capabilities(&self, path: &str) -> Option<PortCapabilities>;

    /// Capabilities of the port after platform restrictions are applied
    fn effective_capabilities(&self, path: &str) -> Option<PortCapabilities> {
        let platform = self.platform();
        self.port_capabilities(path).map(|caps| caps.restricted_by(&platform))
    }
}

/// Capability provider backed by a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilityProvider {
    platform: PlatformInfo,
    fallback: Option<PortCapabilities>,
    ports: HashMap<String, PortCapabilities>,
}

impl StaticCapabilityProvider {
    /// Create a provider for the given platform with no known ports
    pub fn new(platform: PlatformInfo) -> Self {
        Self {
            platform,
            fallback: None,
            ports: HashMap::new(),
        }
    }

    /// Describe a specific port
    pub fn with_port<S: Into<String>>(mut self, path: S, caps: PortCapabilities) -> Self {
        self.ports.insert(path.into(), caps);
        self
    }

    /// Capabilities reported for ports not listed explicitly
    pub fn with_fallback(mut self, caps: PortCapabilities) -> Self {
        self.fallback = Some(caps);
        self
    }
}

impl CapabilityProvider for StaticCapabilityProvider {
    fn platform(&self) -> PlatformInfo {
        self.platform.clone()
    }

    fn port_capabilities(&self, path: &str) -> Option<PortCapabilities> {
        self.ports.get(path).cloned().or_else(|| self.fallback.clone())
    }
}
