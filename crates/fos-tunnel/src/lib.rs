//! fOS Tunnel - Connection Control Core
//!
//! Decides which WireGuard relay to connect to, how to obfuscate the
//! connection, and how the tunnel moves between connecting, connected,
//! reconnecting, blocked and stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TunnelActor                           │
//! │                                                              │
//! │  events ──▶ ┌─────────┐  effects  ┌──────────────────────┐   │
//! │             │ reducer │──────────▶│ executor             │   │
//! │             └────┬────┘           │  ConnectionPlanner ──┼─┐ │
//! │                  │                │  TunnelDriver        │ │ │
//! │                  ▼                └──────────┬───────────┘ │ │
//! │           watch<TunnelStatus>                │ feedback    │ │
//! │                                              ▼             │ │
//! │                                         mailbox            │ │
//! └────────────────────────────────────────────────────────────│─┘
//!                                                              ▼
//!                  ┌────────────────┐    ┌──────────────────────────┐
//!                  │ SettingsReader │    │ RelaySelector            │
//!                  └────────────────┘    │  constraints + weights   │
//!                                        │  obfuscation + ports     │
//!                                        │  SharedDirectory         │
//!                                        └──────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Weighted relay selection**: location, ownership, provider and
//!   custom-list filters, multihop entry/exit pairs, DAITA
//! - **Obfuscation**: UDP-over-TCP, Shadowsocks, QUIC and LWO with an
//!   automatic rotation across failed attempts
//! - **Pure state machine**: every transition is `(state, event) ->
//!   (state, effects)` and runs in one serialized mailbox
//! - **Blocked state**: traffic stays blocked on errors, with periodic
//!   recovery for conditions that clear by themselves
//! - **Key rotation**: the prior key stays in use for a grace period

mod actor;
mod config;
mod connection;
mod constraint;
mod directory;
mod driver;
mod ipc;
mod keys;
mod location;
mod obfuscation;
mod reducer;
mod relay_selector;
mod state;

pub use actor::{ActorError, ActorHandle, TunnelActor};
pub use config::{
    ActorTimings, DeviceState, FileSettingsReader, InterfaceConfig, Settings, SettingsError,
    SettingsReader, StaticSettingsReader, TunnelConfig, TunnelSettings, CURRENT_SCHEMA_VERSION,
};
pub use connection::{ConnectionPlanner, ConnectionTarget, PreparedAttempt, TunnelConfiguration};
pub use constraint::{Constraint, Ownership, RelayConstraints};
pub use directory::{
    DirectoryError, PortRanges, Relay, RelayDirectory, RelayListDocument, ServerRelay,
    SharedDirectory,
};
pub use driver::{AdapterError, DriverOperation, SimulatedDriver, TunnelDriver};
pub use ipc::{
    ApiProxy, ApiRequest, ApiResponse, AppMessageHandler, MessageError, OfflineApiProxy,
    TunnelProviderMessage,
};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use location::{CustomList, Location, LocationSelector};
pub use obfuscation::{
    obfuscate, CustomPort, IpVersion, NoBypass, ObfuscationBypass, ObfuscationMethod,
    ObfuscationMethodSelector, ObfuscationSettings, ObfuscationState, RelayObfuscation,
    TransportLayer, UdpOverTcpPort, QUIC_PORT,
};
pub use reducer::{
    Effect, Event, LaunchSource, MonitorEvent, NextRelaySelection, ReconnectReason, StartOptions,
};
pub use relay_selector::{
    pick_by_draw, pick_weighted, select_port, select_relays, NoRelaysReason, RelaySelector,
    RelayWithEndpoint, SelectedEndpoint, SelectedRelays, SelectionError,
};
pub use state::{
    BlockedState, BlockedStateReason, ConnectionData, KeyPolicy, NetworkReachability, State,
    StateKind, TaskHandle, TunnelStatus,
};
