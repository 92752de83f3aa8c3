//! Tunnel State
//!
//! Closed set of states the tunnel actor can be in, the per-attempt
//! connection data they carry and the status snapshot published to
//! observers.
//!
//! ```text
//! Initial ──► Connecting ◄──► NegotiatingEphemeralPeer
//!                 │   ▲                 │
//!                 ▼   │                 ▼
//!             Connected ◄──────► Reconnecting
//!                 │
//!   any ──► Error ──► Disconnecting ──► Disconnected
//! ```

use crate::config::SettingsError;
use crate::connection::ConnectionTarget;
use crate::constraint::RelayConstraints;
use crate::keys::PrivateKey;
use crate::relay_selector::{NoRelaysReason, SelectedRelays, SelectionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Cancellable background task (key grace timer)
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    abort: Option<Arc<AbortHandle>>,
}

impl TaskHandle {
    pub fn new(id: u64, abort: AbortHandle) -> Self {
        Self {
            id,
            abort: Some(Arc::new(abort)),
        }
    }

    /// Handle with nothing to abort
    pub fn detached(id: u64) -> Self {
        Self { id, abort: None }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskHandle({})", self.id)
    }
}

/// Which device key the tunnel should use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Key from the current settings
    #[default]
    UseCurrent,
    /// Keep the key from before a rotation until the grace task fires
    UsePrior(PrivateKey, TaskHandle),
}

impl KeyPolicy {
    pub fn prior_key(&self) -> Option<&PrivateKey> {
        match self {
            KeyPolicy::UseCurrent => None,
            KeyPolicy::UsePrior(key, _) => Some(key),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkReachability {
    #[default]
    Undetermined,
    Reachable,
    Unreachable,
}

impl From<bool> for NetworkReachability {
    fn from(reachable: bool) -> Self {
        if reachable {
            Self::Reachable
        } else {
            Self::Unreachable
        }
    }
}

/// Data carried through every connection-family state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionData {
    /// Set once the attempt has been planned
    pub target: Option<ConnectionTarget>,
    pub relay_constraints: RelayConstraints,
    pub key_policy: KeyPolicy,
    pub network_reachability: NetworkReachability,
    /// Failed or lost connections since the last success
    pub connection_attempt_count: u32,
    pub is_post_quantum: bool,
    pub is_daita_enabled: bool,
    pub last_key_rotation: Option<DateTime<Utc>>,
}

impl ConnectionData {
    pub fn selected_relays(&self) -> Option<&SelectedRelays> {
        self.target.as_ref().map(|target| &target.configuration.relays)
    }
}

/// Why the tunnel is blocking traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedStateReason {
    NoRelaysSatisfyingConstraints,
    InvalidPort,
    OutdatedSchema,
    ReadSettings,
    DeviceLocked,
    DeviceRevoked,
    DeviceLoggedOut,
    TunnelAdapter,
    Unknown,
}

impl BlockedStateReason {
    /// Reasons that may clear without user action and get retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DeviceLocked | Self::TunnelAdapter)
    }
}

impl fmt::Display for BlockedStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoRelaysSatisfyingConstraints => "no relays satisfying constraints",
            Self::InvalidPort => "invalid port",
            Self::OutdatedSchema => "outdated settings schema",
            Self::ReadSettings => "failed to read settings",
            Self::DeviceLocked => "device locked",
            Self::DeviceRevoked => "device revoked",
            Self::DeviceLoggedOut => "device logged out",
            Self::TunnelAdapter => "tunnel adapter failure",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

impl From<&SelectionError> for BlockedStateReason {
    fn from(error: &SelectionError) -> Self {
        match error.reason() {
            NoRelaysReason::InvalidPort => Self::InvalidPort,
            NoRelaysReason::NoMatchingRelay | NoRelaysReason::NoPortRanges => {
                Self::NoRelaysSatisfyingConstraints
            }
        }
    }
}

impl From<&SettingsError> for BlockedStateReason {
    fn from(error: &SettingsError) -> Self {
        match error {
            SettingsError::IoError(_)
            | SettingsError::ParseError(_)
            | SettingsError::UnsupportedFormat => Self::ReadSettings,
            SettingsError::OutdatedSchema(_) => Self::OutdatedSchema,
            SettingsError::DeviceLocked => Self::DeviceLocked,
            SettingsError::LoggedOut => Self::DeviceLoggedOut,
            SettingsError::Revoked => Self::DeviceRevoked,
        }
    }
}

/// Name of a state, without its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Created, not started yet
    Initial,
    /// First attempt, or recovery out of the error state
    Connecting,
    /// Tunnel monitor reported the tunnel up
    Connected,
    /// New attempt after having been connected
    Reconnecting,
    /// Waiting for the post-quantum / DAITA peer
    NegotiatingEphemeralPeer,
    /// Stopping, waiting for the teardown to complete
    Disconnecting,
    /// Stopped for good
    Disconnected,
    /// Blocking traffic
    Error,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockedState {
    pub reason: BlockedStateReason,
    pub prior_state: StateKind,
    pub key_policy: KeyPolicy,
    pub network_reachability: NetworkReachability,
    pub last_key_rotation: Option<DateTime<Utc>>,
    /// Failed attempts so far, carried into the recovery attempt
    pub connection_attempt_count: u32,
}

/// Tunnel actor state
#[derive(Debug, Clone, Default, PartialEq)]
pub enum State {
    #[default]
    Initial,
    Connecting(ConnectionData),
    Connected(ConnectionData),
    Reconnecting(ConnectionData),
    NegotiatingEphemeralPeer(ConnectionData),
    /// Data is absent when stopping from the error state
    Disconnecting(Option<ConnectionData>),
    Disconnected,
    Error(BlockedState),
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Initial => StateKind::Initial,
            State::Connecting(_) => StateKind::Connecting,
            State::Connected(_) => StateKind::Connected,
            State::Reconnecting(_) => StateKind::Reconnecting,
            State::NegotiatingEphemeralPeer(_) => StateKind::NegotiatingEphemeralPeer,
            State::Disconnecting(_) => StateKind::Disconnecting,
            State::Disconnected => StateKind::Disconnected,
            State::Error(_) => StateKind::Error,
        }
    }

    pub fn connection_data(&self) -> Option<&ConnectionData> {
        match self {
            State::Connecting(data)
            | State::Connected(data)
            | State::Reconnecting(data)
            | State::NegotiatingEphemeralPeer(data) => Some(data),
            State::Disconnecting(data) => data.as_ref(),
            _ => None,
        }
    }

    pub fn key_policy(&self) -> Option<&KeyPolicy> {
        match self {
            State::Error(blocked) => Some(&blocked.key_policy),
            other => other.connection_data().map(|data| &data.key_policy),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, State::Connected(_))
    }

    /// Failed or lost connections since the last success
    pub fn connection_attempt_count(&self) -> u32 {
        match self {
            State::Error(blocked) => blocked.connection_attempt_count,
            other => other.connection_data().map_or(0, |data| data.connection_attempt_count),
        }
    }

    /// Snapshot for observers and `GetTunnelStatus`
    pub fn status(&self) -> TunnelStatus {
        let (block_state_reason, reachability, last_key_rotation) = match self {
            State::Error(blocked) => (
                Some(blocked.reason),
                blocked.network_reachability,
                blocked.last_key_rotation,
            ),
            other => match other.connection_data() {
                Some(data) => (None, data.network_reachability, data.last_key_rotation),
                None => (None, NetworkReachability::Undetermined, None),
            },
        };

        let data = self.connection_data();
        TunnelStatus {
            state: self.kind(),
            block_state_reason,
            is_network_reachable: reachability == NetworkReachability::Reachable,
            last_key_rotation,
            tunnel_relays: data.and_then(|d| d.selected_relays()).cloned(),
            number_of_failed_attempts: self.connection_attempt_count(),
        }
    }
}

/// Observed tunnel status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub state: StateKind,
    pub block_state_reason: Option<BlockedStateReason>,
    pub is_network_reachable: bool,
    pub last_key_rotation: Option<DateTime<Utc>>,
    pub tunnel_relays: Option<SelectedRelays>,
    pub number_of_failed_attempts: u32,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        State::Initial.status()
    }
}
