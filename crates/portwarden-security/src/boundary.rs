/*!
 * Private-network boundary.
 *
 * A listener may bind only to loopback, an RFC-1918 address or the
 * unspecified address. The check runs once, before any listener exists.
 * Binding to the unspecified address hands back a [`PeerFilter`] that the
 * accept loop must apply to every incoming peer.
 */
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use portwarden_core::config::NetworkConfig;

use crate::error::{Result, SecurityError};
use crate::event::{SecurityEvent, SecurityEventKind, ThreatLevel};
use crate::governor::SecurityGovernor;

/// Port assumed when the configured bind address carries none
pub const DEFAULT_LISTEN_PORT: u16 = 0;

const PRIVATE_V4_BLOCKS: [(u32, u32); 3] = [
    // 10.0.0.0/8
    (0x0A00_0000, 0xFF00_0000),
    // 172.16.0.0/12
    (0xAC10_0000, 0xFFF0_0000),
    // 192.168.0.0/16
    (0xC0A8_0000, 0xFFFF_0000),
];

fn unwrap_mapped(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn in_private_block(v4: Ipv4Addr) -> bool {
    let bits = u32::from(v4);
    PRIVATE_V4_BLOCKS
        .iter()
        .any(|&(network, mask)| bits & mask == network)
}

/// Loopback or inside 10/8, 172.16/12 or 192.168/16
pub fn is_rfc1918_address(addr: IpAddr) -> bool {
    match unwrap_mapped(addr) {
        IpAddr::V4(v4) => v4.is_loopback() || in_private_block(v4),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Whether a listener may bind to `addr`
pub fn is_binding_allowed(addr: IpAddr) -> bool {
    is_rfc1918_address(addr) || unwrap_mapped(addr).is_unspecified()
}

/// Result of validating address text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressValidation {
    /// Whether a listener may bind there
    pub valid: bool,
    /// Human-readable explanation
    pub message: String,
}

/// Parse a bind address: a bare IP, `ip:port`, `[v6]:port` or `localhost[:port]`
pub fn parse_bind_address(text: &str) -> Result<SocketAddr> {
    let text = text.trim();
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = text.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_LISTEN_PORT));
    }

    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| SecurityError::InvalidAddress(text.to_string()))?;
            (host, port)
        }
        None => (text, DEFAULT_LISTEN_PORT),
    };
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    Err(SecurityError::InvalidAddress(text.to_string()))
}

/// Validate address text against the boundary
pub fn validate_address(text: &str) -> AddressValidation {
    match parse_bind_address(text) {
        Err(_) => AddressValidation {
            valid: false,
            message: format!("'{}' is not an IP address, ip:port or localhost", text),
        },
        Ok(addr) if is_binding_allowed(addr.ip()) => AddressValidation {
            valid: true,
            message: format!("{} is inside the private-network boundary", addr.ip()),
        },
        Ok(addr) => AddressValidation {
            valid: false,
            message: format!(
                "{} is a public address; only loopback and RFC-1918 ranges are allowed",
                addr.ip()
            ),
        },
    }
}

/// Admits only loopback and RFC-1918 peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerFilter;

impl PeerFilter {
    /// Whether a connection from `peer` may be accepted
    pub fn admits(&self, peer: IpAddr) -> bool {
        is_rfc1918_address(peer)
    }

    /// Like [`admits`](Self::admits), logging refusals to the audit trail
    pub fn admit(&self, peer: IpAddr, governor: &SecurityGovernor) -> bool {
        if self.admits(peer) {
            return true;
        }
        governor.record(SecurityEvent::new(
            SecurityEventKind::BoundaryViolation,
            ThreatLevel::High,
            format!("refused connection from public peer {}", peer),
        ));
        false
    }
}

/// Permission to bind a listener, issued by [`NetworkBoundary::enforce`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPermit {
    /// Address to bind
    pub addr: SocketAddr,
    /// Present when every accepted peer must be filtered
    pub peer_filter: Option<PeerFilter>,
    /// Whether the permit exists only because of an operator override
    pub overridden: bool,
}

impl fmt::Display for BindPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)?;
        if self.peer_filter.is_some() {
            write!(f, " (private peers only)")?;
        }
        if self.overridden {
            write!(f, " (operator override)")?;
        }
        Ok(())
    }
}

/// Startup gate for network listeners
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkBoundary;

impl NetworkBoundary {
    /// Check the configured bind address once, before any listener exists.
    ///
    /// A violation is fatal unless the operator override is set, in which
    /// case it is recorded as a critical event and a filtered permit is
    /// issued.
    pub fn enforce(config: &NetworkConfig, governor: &SecurityGovernor) -> Result<BindPermit> {
        let addr = parse_bind_address(&config.bind_address)?;
        let ip = unwrap_mapped(addr.ip());

        if !is_binding_allowed(ip) {
            if config.operator_override {
                warn!("Binding to public address {} under operator override", addr);
                governor.record(SecurityEvent::new(
                    SecurityEventKind::BoundaryOverride,
                    ThreatLevel::Critical,
                    format!("operator override admitted public bind address {}", addr),
                ));
                return Ok(BindPermit {
                    addr,
                    peer_filter: Some(PeerFilter),
                    overridden: true,
                });
            }

            error!("Refusing to bind to public address {}", addr);
            governor.record(SecurityEvent::new(
                SecurityEventKind::BoundaryViolation,
                ThreatLevel::Critical,
                format!("bind address {} is outside the private-network boundary", addr),
            ));
            return Err(SecurityError::boundary(format!(
                "{} is outside the private-network boundary",
                addr
            )));
        }

        if ip.is_unspecified() {
            if !config.require_peer_filter {
                error!("Binding to {} requires a peer filter", addr);
                governor.record(SecurityEvent::new(
                    SecurityEventKind::BoundaryViolation,
                    ThreatLevel::High,
                    format!("unspecified bind address {} without a peer filter", addr),
                ));
                return Err(SecurityError::boundary(format!(
                    "binding to {} requires require_peer_filter",
                    addr
                )));
            }
            info!("Binding to all interfaces at {} with private peer filter", addr);
            return Ok(BindPermit {
                addr,
                peer_filter: Some(PeerFilter),
                overridden: false,
            });
        }

        info!("Bind address {} is inside the private-network boundary", addr);
        Ok(BindPermit {
            addr,
            peer_filter: None,
            overridden: false,
        })
    }
}
