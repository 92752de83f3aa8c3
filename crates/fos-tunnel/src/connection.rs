//! Connection Planning
//!
//! Turns a `startConnection`/`restartConnection` request into a concrete
//! attempt: reads settings, picks relays and obfuscation, chooses the
//! device key and derives the endpoint the tunnel should dial.

use crate::config::SettingsReader;
use crate::constraint::RelayConstraints;
use crate::directory::SharedDirectory;
use crate::keys::PrivateKey;
use crate::obfuscation::{ObfuscationBypass, ObfuscationMethod, TransportLayer};
use crate::reducer::{NextRelaySelection, ReconnectReason};
use crate::relay_selector::{self, SelectedRelays};
use crate::state::{BlockedStateReason, State, StateKind};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

/// What the tunnel adapter is configured with
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfiguration {
    pub private_key: PrivateKey,
    pub interface_addresses: Vec<IpAddr>,
    pub dns_servers: Vec<IpAddr>,
    pub relays: SelectedRelays,
    /// Negotiated post-quantum / DAITA peer key, replaces `private_key`
    pub ephemeral_key: Option<PrivateKey>,
}

impl TunnelConfiguration {
    pub fn active_key(&self) -> &PrivateKey {
        self.ephemeral_key.as_ref().unwrap_or(&self.private_key)
    }

    /// Configured DNS servers, or the exit gateway when none are set
    pub fn dns(&self) -> Vec<IpAddr> {
        if self.dns_servers.is_empty() {
            vec![IpAddr::V4(self.relays.exit.endpoint.ipv4_gateway)]
        } else {
            self.dns_servers.clone()
        }
    }

    pub fn with_ephemeral_key(&self, key: PrivateKey) -> Self {
        Self {
            ephemeral_key: Some(key),
            ..self.clone()
        }
    }
}

/// Planned connection, as recorded in the state
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionTarget {
    pub configuration: TunnelConfiguration,
    pub connected_endpoint: SocketAddr,
    pub transport_layer: TransportLayer,
    pub remote_port: u16,
    pub obfuscation_method: ObfuscationMethod,
}

impl ConnectionTarget {
    pub fn new(configuration: TunnelConfiguration) -> Self {
        let ingress = configuration.relays.ingress().endpoint.clone();
        let obfuscation_method = configuration.relays.obfuscation;
        Self {
            connected_endpoint: ingress.socket_address,
            transport_layer: ingress.transport,
            remote_port: ingress.socket_address.port(),
            obfuscation_method,
            configuration,
        }
    }
}

/// Result of planning, fed back to the reducer
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedAttempt {
    pub target: ConnectionTarget,
    pub relay_constraints: RelayConstraints,
    pub connection_attempt_count: u32,
    pub is_post_quantum: bool,
    pub is_daita_enabled: bool,
}

impl PreparedAttempt {
    pub fn needs_ephemeral_peer(&self) -> bool {
        self.is_post_quantum || self.is_daita_enabled
    }
}

/// Prepares connection attempts against the current settings and directory
pub struct ConnectionPlanner<'a> {
    settings: &'a dyn SettingsReader,
    directory: &'a SharedDirectory,
    bypass: &'a dyn ObfuscationBypass,
}

impl<'a> ConnectionPlanner<'a> {
    pub fn new(
        settings: &'a dyn SettingsReader,
        directory: &'a SharedDirectory,
        bypass: &'a dyn ObfuscationBypass,
    ) -> Self {
        Self {
            settings,
            directory,
            bypass,
        }
    }

    /// Plan the next attempt from `state`.
    ///
    /// A connection loss counts as a failed attempt, and so does retrying
    /// out of the error state. Either moves the automatic obfuscation
    /// rotation forward.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        state: &State,
        selection: &NextRelaySelection,
        reason: Option<ReconnectReason>,
        rng: &mut R,
    ) -> Result<PreparedAttempt, BlockedStateReason> {
        let settings = self.settings.read().map_err(|e| {
            warn!("Failed to read settings: {}", e);
            BlockedStateReason::from(&e)
        })?;

        let mut attempt = state.connection_attempt_count();
        if reason == Some(ReconnectReason::ConnectionLoss) || state.kind() == StateKind::Error {
            attempt = attempt.saturating_add(1);
        }

        let current = state.connection_data().and_then(|d| d.selected_relays());
        let relays = match (selection, current) {
            (NextRelaySelection::PreSelected(relays), _) => relays.clone(),
            (NextRelaySelection::Current, Some(relays)) => relays.clone(),
            (NextRelaySelection::Current, None) | (NextRelaySelection::Random, _) => {
                let directory = self.directory.snapshot();
                relay_selector::select_relays(&directory, &settings.tunnel, attempt, self.bypass, rng)
                    .map_err(|e| {
                        warn!("Relay selection failed: {}", e);
                        BlockedStateReason::from(&e)
                    })?
            }
        };

        let private_key = match state.key_policy().and_then(|policy| policy.prior_key()) {
            Some(prior) => {
                debug!("Using prior key during rotation grace period");
                prior.clone()
            }
            None => settings.private_key,
        };

        let configuration = TunnelConfiguration {
            private_key,
            interface_addresses: settings.interface_addresses,
            dns_servers: settings.dns_servers,
            relays,
            ephemeral_key: None,
        };

        Ok(PreparedAttempt {
            target: ConnectionTarget::new(configuration),
            relay_constraints: settings.tunnel.relay_constraints,
            connection_attempt_count: attempt,
            is_post_quantum: settings.tunnel.post_quantum,
            is_daita_enabled: settings.tunnel.daita,
        })
    }
}
