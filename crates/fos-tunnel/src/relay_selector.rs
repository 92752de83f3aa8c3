//! Relay Selection
//!
//! Picks the relays for a connection attempt from a directory snapshot:
//!
//! 1. Filter to active relays matching location, ownership and providers
//! 2. Weighted random pick (uniform when every weight is zero)
//! 3. Port from the constraint, validated against the advertised ranges
//! 4. Endpoint from the relay address, port and directory gateways
//!
//! With multihop the obfuscation applies to the entry hop and the exit
//! keeps the plain WireGuard port.

use crate::config::TunnelSettings;
use crate::constraint::{Constraint, RelayConstraints};
use crate::directory::{PortRanges, Relay, RelayDirectory};
use crate::keys::PublicKey;
use crate::location::CustomList;
use crate::obfuscation::{
    self, ObfuscationBypass, ObfuscationMethod, RelayObfuscation, TransportLayer,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// Why no relay could be selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoRelaysReason {
    /// No active relay matches the constraints
    NoMatchingRelay,
    /// Pinned port lies outside the advertised ranges
    InvalidPort,
    /// Directory advertises no usable port
    NoPortRanges,
}

impl fmt::Display for NoRelaysReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingRelay => write!(f, "no matching relay"),
            Self::InvalidPort => write!(f, "invalid port"),
            Self::NoPortRanges => write!(f, "no port ranges"),
        }
    }
}

/// Relay selection errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("No relays satisfying constraints: {0}")]
    NoRelaysSatisfyingConstraints(NoRelaysReason),
}

impl SelectionError {
    pub fn reason(&self) -> NoRelaysReason {
        match self {
            Self::NoRelaysSatisfyingConstraints(reason) => *reason,
        }
    }
}

/// Everything the tunnel needs to reach one relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedEndpoint {
    pub socket_address: SocketAddr,
    pub transport: TransportLayer,
    pub ipv4_gateway: Ipv4Addr,
    pub ipv6_gateway: Option<Ipv6Addr>,
    pub public_key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayWithEndpoint {
    pub relay: Relay,
    pub endpoint: SelectedEndpoint,
}

impl RelayWithEndpoint {
    pub fn hostname(&self) -> &str {
        &self.relay.hostname
    }
}

/// Relays chosen for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedRelays {
    pub exit: RelayWithEndpoint,
    /// Present only with multihop
    pub entry: Option<RelayWithEndpoint>,
    /// Obfuscation applied to the ingress hop
    pub obfuscation: ObfuscationMethod,
    /// Attempt count the selection was made for
    pub retry_attempt: u32,
}

impl SelectedRelays {
    /// Hop the device connects to directly
    pub fn ingress(&self) -> &RelayWithEndpoint {
        self.entry.as_ref().unwrap_or(&self.exit)
    }
}

impl fmt::Display for SelectedRelays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Some(entry) => write!(f, "{} via {}", self.exit.hostname(), entry.hostname()),
            None => write!(f, "{}", self.exit.hostname()),
        }
    }
}

/// Index of the relay selected by `draw`, a value in `[1, total weight]`.
///
/// Walks the list subtracting weights until the draw is used up, so a
/// fixed draw always lands on the same relay.
pub fn pick_by_draw(weights: &[u64], mut draw: u64) -> Option<usize> {
    for (index, &weight) in weights.iter().enumerate() {
        if draw <= weight {
            return Some(index);
        }
        draw -= weight;
    }
    None
}

/// Weighted random pick. When every weight is zero the pick is uniform.
pub fn pick_weighted<'a, R: Rng + ?Sized>(relays: &[&'a Relay], rng: &mut R) -> Option<&'a Relay> {
    if relays.is_empty() {
        return None;
    }

    let weights: Vec<u64> = relays.iter().map(|relay| relay.weight).collect();
    let total = weights.iter().fold(0u64, |acc, w| acc.saturating_add(*w));
    if total == 0 {
        return relays.get(rng.gen_range(0..relays.len())).copied();
    }

    pick_by_draw(&weights, rng.gen_range(1..=total)).and_then(|index| relays.get(index).copied())
}

/// Port for a WireGuard hop: a pinned port must lie in `ranges`, `Any`
/// picks uniformly across all advertised ports.
pub fn select_port<R: Rng + ?Sized>(
    ranges: &PortRanges,
    constraint: &Constraint<u16>,
    rng: &mut R,
) -> Result<u16, SelectionError> {
    match constraint {
        Constraint::Only(port) if ranges.contains(*port) => Ok(*port),
        Constraint::Only(_) => Err(SelectionError::NoRelaysSatisfyingConstraints(
            NoRelaysReason::InvalidPort,
        )),
        Constraint::Any => ranges
            .pick_random(rng)
            .ok_or(SelectionError::NoRelaysSatisfyingConstraints(NoRelaysReason::NoPortRanges)),
    }
}

/// Selects relays out of a directory snapshot
pub struct RelaySelector<'a> {
    directory: &'a RelayDirectory,
    custom_lists: &'a [CustomList],
}

impl<'a> RelaySelector<'a> {
    pub fn new(directory: &'a RelayDirectory) -> Self {
        Self {
            directory,
            custom_lists: &[],
        }
    }

    pub fn with_custom_lists(mut self, custom_lists: &'a [CustomList]) -> Self {
        self.custom_lists = custom_lists;
        self
    }

    /// Active relays passing every constraint except the port
    pub fn candidates(&self, constraints: &RelayConstraints) -> Vec<&'a Relay> {
        self.directory
            .relays()
            .iter()
            .filter(|relay| relay.active)
            .filter(|relay| {
                constraints
                    .location
                    .matches_with(|location| location.matches(relay, self.custom_lists))
            })
            .filter(|relay| constraints.ownership.matches(relay.owned))
            .filter(|relay| constraints.provider_matches(&relay.provider))
            .collect()
    }

    /// Pick one relay with a plain WireGuard endpoint
    pub fn select<R: Rng + ?Sized>(
        &self,
        constraints: &RelayConstraints,
        rng: &mut R,
    ) -> Result<RelayWithEndpoint, SelectionError> {
        let relay = self.pick(constraints, None, rng)?;
        let port = select_port(self.directory.port_ranges(), &constraints.port, rng)?;
        Ok(self.endpoint(relay, ObfuscationMethod::Off, port, &TunnelSettings::default()))
    }

    fn pick<R: Rng + ?Sized>(
        &self,
        constraints: &RelayConstraints,
        exclude: Option<&str>,
        rng: &mut R,
    ) -> Result<&'a Relay, SelectionError> {
        let candidates: Vec<&Relay> = self
            .candidates(constraints)
            .into_iter()
            .filter(|relay| exclude != Some(relay.hostname.as_str()))
            .collect();

        debug!("{} candidate relays for {}", candidates.len(), constraints);

        pick_weighted(&candidates, rng).ok_or(SelectionError::NoRelaysSatisfyingConstraints(
            NoRelaysReason::NoMatchingRelay,
        ))
    }

    fn endpoint(
        &self,
        relay: &Relay,
        method: ObfuscationMethod,
        port: u16,
        settings: &TunnelSettings,
    ) -> RelayWithEndpoint {
        let (address, transport) = obfuscation::ingress(
            method,
            relay,
            port,
            self.directory.shadowsocks_port_ranges(),
            settings.ip_version,
        );
        RelayWithEndpoint {
            relay: relay.clone(),
            endpoint: SelectedEndpoint {
                socket_address: SocketAddr::new(address, port),
                transport,
                ipv4_gateway: self.directory.ipv4_gateway(),
                ipv6_gateway: self.directory.ipv6_gateway(),
                public_key: relay.public_key,
            },
        }
    }
}

/// Port for the hop carrying the obfuscation
fn obfuscated_port<R: Rng + ?Sized>(
    obfuscation: &RelayObfuscation,
    rng: &mut R,
) -> Result<u16, SelectionError> {
    let ranges = obfuscation.all_relays.port_ranges();
    match obfuscation.method {
        // WireGuard ports proper, validated against the advertised ranges
        ObfuscationMethod::Off | ObfuscationMethod::Lwo => select_port(ranges, &obfuscation.port, rng),
        _ => match obfuscation.port {
            Constraint::Only(port) => Ok(port),
            Constraint::Any => select_port(ranges, &Constraint::Any, rng),
        },
    }
}

/// Full selection for one attempt: obfuscation, then single or multihop
pub fn select_relays<R: Rng + ?Sized>(
    directory: &Arc<RelayDirectory>,
    settings: &TunnelSettings,
    connection_attempt_count: u32,
    bypass: &dyn ObfuscationBypass,
    rng: &mut R,
) -> Result<SelectedRelays, SelectionError> {
    let obfuscation = obfuscation::obfuscate(directory, settings, connection_attempt_count, bypass, rng)?;
    let method = obfuscation.method;

    // DAITA runs on the hop the device talks to
    let ingress_relays = if settings.daita {
        Arc::new(obfuscation.obfuscated_relays.filtered(|relay| relay.daita))
    } else {
        Arc::clone(&obfuscation.obfuscated_relays)
    };

    let selected = if settings.multihop {
        let exit_selector = RelaySelector::new(directory).with_custom_lists(&settings.custom_lists);
        let exit = exit_selector.pick(&settings.relay_constraints, None, rng)?;
        let exit_port = select_port(directory.port_ranges(), &settings.relay_constraints.port, rng)?;

        let entry_selector = RelaySelector::new(&ingress_relays)
            .with_custom_lists(&settings.custom_lists);
        let entry = entry_selector.pick(&settings.entry_constraints, Some(exit.hostname.as_str()), rng)?;
        let entry_port = obfuscated_port(&obfuscation, rng)?;

        SelectedRelays {
            exit: exit_selector.endpoint(exit, ObfuscationMethod::Off, exit_port, settings),
            entry: Some(entry_selector.endpoint(entry, method, entry_port, settings)),
            obfuscation: method,
            retry_attempt: connection_attempt_count,
        }
    } else {
        let selector = RelaySelector::new(&ingress_relays)
            .with_custom_lists(&settings.custom_lists);
        let exit = selector.pick(&settings.relay_constraints, None, rng)?;
        let port = obfuscated_port(&obfuscation, rng)?;

        SelectedRelays {
            exit: selector.endpoint(exit, method, port, settings),
            entry: None,
            obfuscation: method,
            retry_attempt: connection_attempt_count,
        }
    };

    info!(
        "Selected {} ({} {}, obfuscation {})",
        selected,
        selected.ingress().endpoint.transport,
        selected.ingress().endpoint.socket_address,
        method
    );

    Ok(selected)
}
