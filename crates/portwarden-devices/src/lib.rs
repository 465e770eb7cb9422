/*!
 * Portwarden Devices
 *
 * This crate provides the per-port side of Portwarden: capability
 * descriptors, port options, the transport and GPIO traits, the RS-485
 * direction controller, the port state machine and the port registry.
 */

#![warn(missing_docs)]

// Re-export core types
pub use portwarden_core::prelude;

pub mod capability;
pub mod direction;
pub mod error;
pub mod mock;
pub mod options;
pub mod port;
pub mod registry;
pub mod transport;

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(feature = "gpio")]
pub mod gpio;

pub use capability::{
    CapabilityProvider, GpioAccess, PlatformInfo, PlatformKind, PortCapabilities, Rs485Support,
    StaticCapabilityProvider, TimingPrecision, Virtualization,
};
pub use direction::{DirectionController, DirectionMode, TransmitGuard};
pub use error::{PortError, Result, TransportError};
pub use options::{PortOptions, PortOptionsPatch, Rs485Timing, WritePolicy};
pub use port::{PortEvent, PortInfo, PortMetrics, PortStateMachine, PortStatus, PortType};
pub use registry::{PortRegistry, RegistryEvent, SharedPortRegistry};
pub use transport::{GpioDirection, GpioLine, SerialTransport};

/// Portwarden devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> std::result::Result<(), portwarden_core::error::Error> {
    tracing::info!("Portwarden Devices {} initialized", VERSION);
    Ok(())
}

/// Hardware adapters compiled into this build
pub fn available_adapters() -> Vec<&'static str> {
    let mut adapters = vec!["mock"];

    #[cfg(feature = "serial")]
    adapters.push("serial");

    #[cfg(feature = "gpio")]
    adapters.push("gpio");

    adapters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_adapter_always_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(available_adapters()[0], "mock");
    }
}
