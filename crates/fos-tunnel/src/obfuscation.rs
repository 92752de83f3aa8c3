//! Obfuscation Selection
//!
//! Decides which transport disguise to layer under WireGuard for an
//! attempt, narrows the relay set to relays able to serve it and fixes
//! the port constraint.
//!
//! ```text
//! attempt ──► ObfuscationMethodSelector ──► bypass ──► method
//!                                                        │
//! directory ─────────────────────────────────────────────┤
//!                                                        ▼
//!                               RelayObfuscation { all, obfuscated, port }
//! ```
//!
//! | Method       | Relay filter                         | Port              |
//! |--------------|--------------------------------------|-------------------|
//! | off          | none                                 | relay constraint  |
//! | udp-over-tcp | none                                 | 80 / 443 / 5001   |
//! | shadowsocks  | extra ingress if port outside ranges | custom or ranges  |
//! | quic         | QUIC relays                          | 443               |
//! | lwo          | LWO relays                           | any or validated  |

use crate::config::TunnelSettings;
use crate::constraint::Constraint;
use crate::directory::{PortRanges, Relay, RelayDirectory};
use crate::relay_selector::{NoRelaysReason, SelectionError};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Port QUIC obfuscation always uses
pub const QUIC_PORT: u16 = 443;

const UDP_OVER_TCP_AUTOMATIC_PORTS: [u16; 2] = [80, 443];

/// Cycle automatic mode walks through, indexed by attempt count
const AUTOMATIC_ROTATION: [ObfuscationMethod; 4] = [
    ObfuscationMethod::Off,
    ObfuscationMethod::Off,
    ObfuscationMethod::Shadowsocks,
    ObfuscationMethod::UdpOverTcp,
];

/// Concrete obfuscation applied to an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObfuscationMethod {
    /// Plain WireGuard over UDP
    Off,
    /// WireGuard wrapped in a TCP stream
    UdpOverTcp,
    /// Shadowsocks proxy in front of the relay
    Shadowsocks,
    /// Masquerades as HTTP/3 on port 443
    Quic,
    /// Lightweight header obfuscation, on relays that offer it
    Lwo,
}

impl fmt::Display for ObfuscationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::UdpOverTcp => "udp-over-tcp",
            Self::Shadowsocks => "shadowsocks",
            Self::Quic => "quic",
            Self::Lwo => "lwo",
        };
        f.write_str(name)
    }
}

/// User-facing obfuscation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObfuscationState {
    #[default]
    Automatic,
    Off,
    UdpOverTcp,
    Shadowsocks,
    Quic,
    Lwo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpOverTcpPort {
    #[default]
    Automatic,
    Port80,
    Port443,
    Port5001,
}

impl UdpOverTcpPort {
    fn fixed(&self) -> Option<u16> {
        match self {
            Self::Automatic => None,
            Self::Port80 => Some(80),
            Self::Port443 => Some(443),
            Self::Port5001 => Some(5001),
        }
    }
}

/// Port choice for shadowsocks and LWO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomPort {
    #[default]
    Automatic,
    Custom(u16),
}

/// Address family used to reach the relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpVersion {
    #[default]
    Automatic,
    V4,
    V6,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationSettings {
    #[serde(default)]
    pub state: ObfuscationState,
    #[serde(default)]
    pub udp_over_tcp_port: UdpOverTcpPort,
    #[serde(default)]
    pub shadowsocks_port: CustomPort,
    #[serde(default)]
    pub lwo_port: CustomPort,
}

/// Rewrites the configured obfuscation state before it is resolved,
/// e.g. to steer away from a method the platform cannot run.
pub trait ObfuscationBypass: Send + Sync {
    fn bypass(&self, state: ObfuscationState) -> ObfuscationState {
        state
    }
}

/// Leaves the configured state untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBypass;

impl ObfuscationBypass for NoBypass {}

/// Resolves the configured state to a concrete method for an attempt
pub struct ObfuscationMethodSelector;

impl ObfuscationMethodSelector {
    pub fn method(state: ObfuscationState, connection_attempt_count: u32) -> ObfuscationMethod {
        match state {
            ObfuscationState::Automatic => {
                AUTOMATIC_ROTATION[connection_attempt_count as usize % AUTOMATIC_ROTATION.len()]
            }
            ObfuscationState::Off => ObfuscationMethod::Off,
            ObfuscationState::UdpOverTcp => ObfuscationMethod::UdpOverTcp,
            ObfuscationState::Shadowsocks => ObfuscationMethod::Shadowsocks,
            ObfuscationState::Quic => ObfuscationMethod::Quic,
            ObfuscationState::Lwo => ObfuscationMethod::Lwo,
        }
    }
}

/// Transport carrying the WireGuard packets to the relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportLayer {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for TransportLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

/// Result of applying obfuscation to a directory snapshot
#[derive(Debug, Clone)]
pub struct RelayObfuscation {
    pub all_relays: Arc<RelayDirectory>,
    /// Always a subset of `all_relays`
    pub obfuscated_relays: Arc<RelayDirectory>,
    pub port: Constraint<u16>,
    pub method: ObfuscationMethod,
}

/// Apply the configured obfuscation to `relays` for this attempt.
///
/// Fails only when LWO is configured with a custom port outside the
/// WireGuard port ranges. An empty filtered set is returned as is and
/// surfaces as a selection failure later.
pub fn obfuscate<R: Rng + ?Sized>(
    relays: &Arc<RelayDirectory>,
    settings: &TunnelSettings,
    connection_attempt_count: u32,
    bypass: &dyn ObfuscationBypass,
    rng: &mut R,
) -> Result<RelayObfuscation, SelectionError> {
    let obfuscation = &settings.obfuscation;
    let state = bypass.bypass(obfuscation.state);
    let method = ObfuscationMethodSelector::method(state, connection_attempt_count);
    let base_port = settings.relay_constraints.port.clone();
    let ipv6 = settings.ip_version == IpVersion::V6;

    let (obfuscated_relays, port) = match method {
        ObfuscationMethod::Off => (Arc::clone(relays), base_port),
        ObfuscationMethod::UdpOverTcp => {
            let port = match obfuscation.udp_over_tcp_port.fixed() {
                Some(port) => port,
                None => *UDP_OVER_TCP_AUTOMATIC_PORTS.choose(rng).unwrap_or(&443),
            };
            (Arc::clone(relays), Constraint::Only(port))
        }
        ObfuscationMethod::Shadowsocks => {
            let ranges = relays.shadowsocks_port_ranges();
            match obfuscation.shadowsocks_port {
                CustomPort::Custom(port) if !ranges.contains(port) => {
                    let filtered = relays.filtered(|relay| {
                        if ipv6 {
                            relay.has_ipv6_shadowsocks_ingress()
                        } else {
                            relay.has_shadowsocks_ingress()
                        }
                    });
                    (Arc::new(filtered), Constraint::Only(port))
                }
                CustomPort::Custom(port) => (Arc::clone(relays), Constraint::Only(port)),
                CustomPort::Automatic => {
                    let port = ranges
                        .pick_random(rng)
                        .map_or(base_port, Constraint::Only);
                    (Arc::clone(relays), port)
                }
            }
        }
        ObfuscationMethod::Quic => {
            let filtered = relays.filtered(|relay| {
                relay.supports(ObfuscationMethod::Quic) && (!ipv6 || relay.has_ipv6_quic_ingress())
            });
            (Arc::new(filtered), Constraint::Only(QUIC_PORT))
        }
        ObfuscationMethod::Lwo => {
            let port = match obfuscation.lwo_port {
                CustomPort::Automatic => Constraint::Any,
                CustomPort::Custom(port) if relays.port_ranges().contains(port) => {
                    Constraint::Only(port)
                }
                CustomPort::Custom(port) => {
                    debug!("LWO port {} outside WireGuard port ranges", port);
                    return Err(SelectionError::NoRelaysSatisfyingConstraints(
                        NoRelaysReason::InvalidPort,
                    ));
                }
            };
            let filtered = relays.filtered(|relay| relay.supports(ObfuscationMethod::Lwo));
            (Arc::new(filtered), port)
        }
    };

    debug!(
        "Obfuscation {} on attempt {}: {} of {} relays, port {}",
        method,
        connection_attempt_count,
        obfuscated_relays.relays().len(),
        relays.relays().len(),
        port
    );

    Ok(RelayObfuscation {
        all_relays: Arc::clone(relays),
        obfuscated_relays,
        port,
        method,
    })
}

/// Address and transport used to reach `relay` under `method`
pub fn ingress(
    method: ObfuscationMethod,
    relay: &Relay,
    port: u16,
    shadowsocks_ranges: &PortRanges,
    ip_version: IpVersion,
) -> (IpAddr, TransportLayer) {
    let relay_addr = relay_address(relay, ip_version);
    match method {
        ObfuscationMethod::Off | ObfuscationMethod::Lwo => (relay_addr, TransportLayer::Udp),
        ObfuscationMethod::UdpOverTcp => (relay_addr, TransportLayer::Tcp),
        ObfuscationMethod::Shadowsocks if !shadowsocks_ranges.contains(port) => {
            let addr = preferred_family(&relay.shadowsocks_extra_addr_in, ip_version)
                .unwrap_or(relay_addr);
            (addr, TransportLayer::Udp)
        }
        ObfuscationMethod::Shadowsocks => (relay_addr, TransportLayer::Udp),
        ObfuscationMethod::Quic => {
            let addr = relay
                .quic
                .as_ref()
                .and_then(|quic| preferred_family(&quic.addr_in, ip_version))
                .unwrap_or(relay_addr);
            (addr, TransportLayer::Udp)
        }
    }
}

/// Relay's plain WireGuard address in the requested family
pub fn relay_address(relay: &Relay, ip_version: IpVersion) -> IpAddr {
    match (ip_version, relay.ipv6_addr_in) {
        (IpVersion::V6, Some(v6)) => IpAddr::V6(v6),
        _ => IpAddr::V4(relay.ipv4_addr_in),
    }
}

fn preferred_family(addrs: &[IpAddr], ip_version: IpVersion) -> Option<IpAddr> {
    let want_v6 = ip_version == IpVersion::V6;
    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == want_v6)
        .or_else(|| addrs.first())
        .copied()
}
