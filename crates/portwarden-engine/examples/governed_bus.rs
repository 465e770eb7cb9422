use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use portwarden_core::config::{ConfigBuilder, SharedConfig};
use portwarden_core::logging;
use portwarden_core::types::Id;
use portwarden_devices::mock::MockTransport;
use portwarden_devices::{
    PlatformInfo, PortCapabilities, PortInfo, PortOptions, PortType, Rs485Support, Rs485Timing,
    StaticCapabilityProvider, TransportError,
};
use portwarden_engine::{Governance, GovernorId};
use portwarden_security::{SecurityLevel, TokenPermissions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ConfigBuilder::new()
        .with_environment_prefix("PORTWARDEN")
        .build()
        .context("loading configuration")?;
    config.governance.system1.probe_interval_ms = 100;
    config.governance.system3.health_check_interval_ms = 200;
    config.governance.system4.analysis_interval_ms = 500;
    config.governance.system5.reporting_interval_ms = 1000;
    logging::init_with_config(&config.logging)?;

    // Two drops on a native RS-485 bus, one USB console
    let rs485 = PortCapabilities {
        rs485: Rs485Support::Native,
        ..PortCapabilities::default()
    };
    let provider = StaticCapabilityProvider::new(PlatformInfo::default())
        .with_port("/dev/ttyS1", rs485.clone())
        .with_port("/dev/ttyS2", rs485)
        .with_fallback(PortCapabilities::default());

    let governance = Governance::new(SharedConfig::new(config), Arc::new(provider))?;

    let drop_a = Arc::new(MockTransport::new());
    let drop_b = Arc::new(MockTransport::new());
    let console = Arc::new(MockTransport::new());
    let bus = PortOptions::new(19_200).with_rs485(Rs485Timing::default().on_bus("bus-a"));

    governance.add_port(
        PortInfo::new("DROP-A", "/dev/ttyS1", PortType::Rs485),
        drop_a.clone(),
        None,
        bus.clone(),
        10,
    )?;
    governance.add_port(
        PortInfo::new("DROP-B", "/dev/ttyS2", PortType::Rs485),
        drop_b.clone(),
        None,
        bus,
        20,
    )?;
    governance.add_port(
        PortInfo::new("CONSOLE", "/dev/ttyUSB0", PortType::UsbSerial),
        console.clone(),
        None,
        PortOptions::new(115_200),
        100,
    )?;

    // The second drop fails its first open; System1 retries it
    drop_b.fail_next_open(TransportError::Io("device busy".to_string()));

    let permit = governance.start().await?;
    println!("Governance running, listener permitted on {}", permit);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // An operator with write access to DROP-A
    let operator = governance.security().generate_token_pair(
        TokenPermissions::full("DROP-A").with_level(SecurityLevel::Administrative),
        Some(Duration::from_secs(300)),
    )?;
    let written = governance
        .service()
        .write(Some(&operator.local_token), &Id::from("DROP-A"), b"\x01\x03\x00\x00\x00\x02")
        .await?;
    println!("Wrote {} bytes to DROP-A", written);

    // A monitor that may only read the console
    let monitor = governance
        .security()
        .generate_token_pair(TokenPermissions::read_only("CONSOLE"), None)?;
    match governance
        .service()
        .write(Some(&monitor.local_token), &Id::from("CONSOLE"), b"reboot\n")
        .await
    {
        Ok(_) => println!("Unexpected: read-only token wrote to CONSOLE"),
        Err(e) => println!("Monitor write refused: {}", e),
    }

    // Pull the console and let the hierarchy notice
    console.disconnect();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let health = governance.health()?;
    println!("{}", serde_json::to_string_pretty(&health)?);

    for cycle in governance.history(&GovernorId::for_port(&Id::from("DROP-B")), 5)? {
        println!(
            "DROP-B cycle {}: {:?} -> {:?}",
            cycle.seq, cycle.severity, cycle.validation
        );
    }

    governance.shutdown(Duration::from_secs(2)).await?;
    println!(
        "Shut down; DROP-A open: {}, DROP-B open: {}",
        drop_a.is_open(),
        drop_b.is_open()
    );
    Ok(())
}
