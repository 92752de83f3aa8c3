//! Connection State Machine
//!
//! Pure transition function of the tunnel actor: `(state, event) ->
//! (state, effects)`. It never performs I/O and never fails; events that
//! make no sense in the current state are ignored.
//!
//! Effects come back in the order the executor must run them.

use crate::connection::{PreparedAttempt, TunnelConfiguration};
use crate::keys::PrivateKey;
use crate::relay_selector::SelectedRelays;
use crate::state::{
    BlockedState, BlockedStateReason, ConnectionData, KeyPolicy, NetworkReachability, State,
    StateKind, TaskHandle,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which relays the next attempt should use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextRelaySelection {
    /// Run the relay selector again
    Random,
    /// Reuse the relays of the current attempt, if any
    Current,
    /// Relays picked by the caller
    PreSelected(SelectedRelays),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectReason {
    /// Asked for by the app or a recovery; the attempt count is kept
    UserInitiated,
    /// Tunnel went down; counts as a failed attempt
    ConnectionLoss,
}

/// Who asked for the tunnel to start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchSource {
    #[default]
    App,
    System,
    OnDemand,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    pub selected_relays: Option<SelectedRelays>,
    pub launch_source: LaunchSource,
}

/// Reports from the tunnel monitor and path observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Handshake completed on the configured tunnel
    ConnectionEstablished,
    /// No traffic from the relay within the monitor's timeout
    ConnectionLost,
    /// Default path became reachable (`true`) or unreachable
    NetworkReachabilityChanged(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Bring the tunnel up
    Start(StartOptions),
    /// Tear the tunnel down; the actor exits afterwards
    Stop,
    /// Start a new attempt
    Reconnect {
        selection: NextRelaySelection,
        reason: ReconnectReason,
    },
    /// Block traffic for `reason`
    Error(BlockedStateReason),
    /// Report from the tunnel monitor or path observer
    Monitor(MonitorEvent),
    /// The device key was rotated at the given date
    NotifyKeyRotated(DateTime<Utc>),
    /// Grace period over, move to the current key
    SwitchKey,

    // Results fed back by the executor
    /// Attempt planned, ready to configure
    ConnectionPrepared(Box<PreparedAttempt>),
    /// Ephemeral peer key to activate
    EphemeralPeerNegotiated(PrivateKey),
    /// Prior key kept alive by `task` until it fires `SwitchKey`
    PriorKeyCached { key: PrivateKey, task: TaskHandle },
    /// Teardown finished
    DisconnectCompleted,
    /// Time to retry out of the error state
    RecoveryTimer,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start(_) => "start",
            Event::Stop => "stop",
            Event::Reconnect { .. } => "reconnect",
            Event::Error(_) => "error",
            Event::Monitor(_) => "monitor",
            Event::NotifyKeyRotated(_) => "notifyKeyRotated",
            Event::SwitchKey => "switchKey",
            Event::ConnectionPrepared(_) => "connectionPrepared",
            Event::EphemeralPeerNegotiated(_) => "ephemeralPeerNegotiated",
            Event::PriorKeyCached { .. } => "priorKeyCached",
            Event::DisconnectCompleted => "disconnectCompleted",
            Event::RecoveryTimer => "recoveryTimer",
        }
    }
}

/// Work for the executor; every stop effect is safe to repeat
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Begin reporting network reachability
    StartDefaultPathObserver,
    StopDefaultPathObserver,
    /// (Re)start watching the tunnel for establishment and loss
    StartTunnelMonitor,
    StopTunnelMonitor,
    /// Plan the first attempt
    StartConnection(NextRelaySelection),
    /// Plan a new attempt from the current state
    RestartConnection(NextRelaySelection, ReconnectReason),
    /// Bring the adapter down
    StopTunnelAdapter,
    /// Cancel timers and report the teardown complete
    SetDisconnectedState,
    /// Stop the monitor, block traffic and arm recovery if it applies
    ConfigureForErrorState(BlockedStateReason),
    /// Keep the key in use alive for the grace period
    CacheActiveKey(DateTime<Utc>),
    /// Abort a background task
    CancelTask(TaskHandle),
    /// Feed a user-initiated reconnect back into the mailbox
    Reconnect(NextRelaySelection),
    /// Apply a configuration to the adapter
    ConfigureTunnel(Box<TunnelConfiguration>),
    /// Negotiate an ephemeral peer over the configured tunnel
    NegotiateEphemeralPeer(Box<TunnelConfiguration>),
    /// Reconfigure the adapter with the negotiated key
    ActivateEphemeralPeer(Box<TunnelConfiguration>),
}

impl State {
    /// Apply `event`, returning the next state and the effects to run
    pub fn reduce(self, event: &Event) -> (State, Vec<Effect>) {
        debug!("Reducing {} in {}", event.name(), self.kind());
        let before = self.kind();

        let (next, effects) = match event {
            Event::Start(options) => self.on_start(options),
            Event::Stop => self.on_stop(),
            Event::Reconnect { selection, reason } => self.on_reconnect(selection, *reason),
            Event::Error(reason) => self.on_error(*reason),
            Event::Monitor(monitor) => self.on_monitor(*monitor),
            Event::NotifyKeyRotated(date) => self.on_key_rotated(*date),
            Event::SwitchKey => self.on_switch_key(),
            Event::ConnectionPrepared(attempt) => self.on_connection_prepared(attempt),
            Event::EphemeralPeerNegotiated(key) => self.on_ephemeral_peer(key),
            Event::PriorKeyCached { key, task } => self.on_prior_key_cached(key, task),
            Event::DisconnectCompleted => match self {
                State::Disconnecting(_) => (State::Disconnected, vec![]),
                other => (other, vec![]),
            },
            Event::RecoveryTimer => match self {
                State::Error(blocked) if blocked.reason.is_recoverable() => (
                    State::Error(blocked),
                    vec![Effect::RestartConnection(
                        NextRelaySelection::Random,
                        ReconnectReason::UserInitiated,
                    )],
                ),
                other => (other, vec![]),
            },
        };

        if next.kind() != before {
            debug!("State {} -> {}", before, next.kind());
        }
        (next, effects)
    }

    fn on_start(self, options: &StartOptions) -> (State, Vec<Effect>) {
        match self {
            State::Initial => {
                let selection = match &options.selected_relays {
                    Some(relays) => NextRelaySelection::PreSelected(relays.clone()),
                    None => NextRelaySelection::Random,
                };
                (
                    State::Connecting(ConnectionData::default()),
                    vec![
                        Effect::StartDefaultPathObserver,
                        Effect::StartTunnelMonitor,
                        Effect::StartConnection(selection),
                    ],
                )
            }
            other => (other, vec![]),
        }
    }

    fn on_stop(self) -> (State, Vec<Effect>) {
        match self {
            State::Connecting(data)
            | State::Connected(data)
            | State::Reconnecting(data)
            | State::NegotiatingEphemeralPeer(data) => (
                State::Disconnecting(Some(data)),
                vec![
                    Effect::StopTunnelMonitor,
                    Effect::StopDefaultPathObserver,
                    Effect::StopTunnelAdapter,
                    Effect::SetDisconnectedState,
                ],
            ),
            // The monitor is already down in the blocked state
            State::Error(_) => (
                State::Disconnecting(None),
                vec![
                    Effect::StopDefaultPathObserver,
                    Effect::StopTunnelAdapter,
                    Effect::SetDisconnectedState,
                ],
            ),
            other => (other, vec![]),
        }
    }

    fn on_reconnect(
        self,
        selection: &NextRelaySelection,
        reason: ReconnectReason,
    ) -> (State, Vec<Effect>) {
        let restart = Effect::RestartConnection(selection.clone(), reason);
        match self {
            state @ (State::Connecting(_)
            | State::Connected(_)
            | State::Reconnecting(_)
            | State::NegotiatingEphemeralPeer(_)) => {
                let effects = match reason {
                    ReconnectReason::UserInitiated => vec![Effect::StopTunnelMonitor, restart],
                    ReconnectReason::ConnectionLoss => vec![restart],
                };
                (state, effects)
            }
            state @ State::Error(_) => (state, vec![restart]),
            other => (other, vec![]),
        }
    }

    fn on_error(self, reason: BlockedStateReason) -> (State, Vec<Effect>) {
        let prior_state = self.kind();
        let blocked = match self {
            State::Connecting(data)
            | State::Connected(data)
            | State::Reconnecting(data)
            | State::NegotiatingEphemeralPeer(data) => BlockedState {
                reason,
                prior_state,
                key_policy: data.key_policy,
                network_reachability: data.network_reachability,
                last_key_rotation: data.last_key_rotation,
                connection_attempt_count: data.connection_attempt_count,
            },
            State::Error(blocked) => BlockedState { reason, ..blocked },
            // Failing before the first start, e.g. settings locked at boot
            State::Initial => BlockedState {
                reason,
                prior_state,
                key_policy: KeyPolicy::UseCurrent,
                network_reachability: NetworkReachability::Undetermined,
                last_key_rotation: None,
                connection_attempt_count: 0,
            },
            // Nothing to block once stopping
            other => return (other, vec![]),
        };
        (
            State::Error(blocked),
            vec![Effect::ConfigureForErrorState(reason)],
        )
    }

    fn on_monitor(self, event: MonitorEvent) -> (State, Vec<Effect>) {
        match (event, self) {
            (MonitorEvent::ConnectionEstablished, State::Connecting(mut data))
            | (MonitorEvent::ConnectionEstablished, State::Reconnecting(mut data)) => {
                data.connection_attempt_count = 0;
                (State::Connected(data), vec![])
            }
            (
                MonitorEvent::ConnectionLost,
                state @ (State::Connecting(_)
                | State::Connected(_)
                | State::Reconnecting(_)
                | State::NegotiatingEphemeralPeer(_)),
            ) => (
                state,
                vec![Effect::RestartConnection(
                    NextRelaySelection::Random,
                    ReconnectReason::ConnectionLoss,
                )],
            ),
            (MonitorEvent::NetworkReachabilityChanged(reachable), mut state) => {
                let reachability = NetworkReachability::from(reachable);
                match &mut state {
                    State::Error(blocked) => blocked.network_reachability = reachability,
                    State::Connecting(data)
                    | State::Connected(data)
                    | State::Reconnecting(data)
                    | State::NegotiatingEphemeralPeer(data) => {
                        data.network_reachability = reachability
                    }
                    _ => {}
                }
                (state, vec![])
            }
            (_, state) => (state, vec![]),
        }
    }

    /// Key policy of the states that track one (not while stopping)
    fn key_policy_mut(&mut self) -> Option<&mut KeyPolicy> {
        match self {
            State::Error(blocked) => Some(&mut blocked.key_policy),
            State::Connecting(data)
            | State::Connected(data)
            | State::Reconnecting(data)
            | State::NegotiatingEphemeralPeer(data) => Some(&mut data.key_policy),
            _ => None,
        }
    }

    fn on_key_rotated(mut self, date: DateTime<Utc>) -> (State, Vec<Effect>) {
        if !matches!(self.key_policy_mut(), Some(KeyPolicy::UseCurrent)) {
            return (self, vec![]);
        }

        match &mut self {
            State::Error(blocked) => blocked.last_key_rotation = Some(date),
            State::Connecting(data)
            | State::Connected(data)
            | State::Reconnecting(data)
            | State::NegotiatingEphemeralPeer(data) => data.last_key_rotation = Some(date),
            _ => {}
        }
        (self, vec![Effect::CacheActiveKey(date)])
    }

    fn on_prior_key_cached(mut self, key: &PrivateKey, task: &TaskHandle) -> (State, Vec<Effect>) {
        match self.key_policy_mut() {
            Some(policy @ KeyPolicy::UseCurrent) => {
                *policy = KeyPolicy::UsePrior(key.clone(), task.clone());
                (self, vec![])
            }
            // Already on a prior key, or stopped while the key was cached
            _ => (self, vec![Effect::CancelTask(task.clone())]),
        }
    }

    fn on_switch_key(mut self) -> (State, Vec<Effect>) {
        match self.key_policy_mut().map(std::mem::take) {
            Some(KeyPolicy::UsePrior(_, task)) => (
                self,
                vec![
                    Effect::CancelTask(task),
                    Effect::Reconnect(NextRelaySelection::Random),
                ],
            ),
            _ => (self, vec![]),
        }
    }

    fn on_connection_prepared(self, attempt: &PreparedAttempt) -> (State, Vec<Effect>) {
        let mut effects = Vec::with_capacity(3);
        let (mut data, was_connected) = match self {
            State::Connecting(data) | State::NegotiatingEphemeralPeer(data) => (data, false),
            State::Connected(data) | State::Reconnecting(data) => (data, true),
            State::Error(blocked) => {
                // Blocked before `start` ever ran the observer
                if blocked.prior_state == StateKind::Initial {
                    effects.push(Effect::StartDefaultPathObserver);
                }
                let data = ConnectionData {
                    key_policy: blocked.key_policy,
                    network_reachability: blocked.network_reachability,
                    last_key_rotation: blocked.last_key_rotation,
                    connection_attempt_count: blocked.connection_attempt_count,
                    ..ConnectionData::default()
                };
                (data, false)
            }
            // Attempt outlived a stop
            other => return (other, vec![]),
        };

        data.target = Some(attempt.target.clone());
        data.relay_constraints = attempt.relay_constraints.clone();
        data.connection_attempt_count = attempt.connection_attempt_count;
        data.is_post_quantum = attempt.is_post_quantum;
        data.is_daita_enabled = attempt.is_daita_enabled;

        let configuration = Box::new(attempt.target.configuration.clone());
        effects.push(Effect::ConfigureTunnel(configuration.clone()));
        if attempt.needs_ephemeral_peer() {
            effects.push(Effect::NegotiateEphemeralPeer(configuration));
            return (State::NegotiatingEphemeralPeer(data), effects);
        }

        // The monitor is restarted for every configured endpoint
        effects.push(Effect::StartTunnelMonitor);
        if was_connected {
            (State::Reconnecting(data), effects)
        } else {
            (State::Connecting(data), effects)
        }
    }

    fn on_ephemeral_peer(self, key: &PrivateKey) -> (State, Vec<Effect>) {
        match self {
            State::NegotiatingEphemeralPeer(mut data) => match data.target.take() {
                Some(mut target) => {
                    target.configuration = target.configuration.with_ephemeral_key(key.clone());
                    let configuration = Box::new(target.configuration.clone());
                    data.target = Some(target);
                    (
                        State::Connecting(data),
                        vec![
                            Effect::ActivateEphemeralPeer(configuration),
                            Effect::StartTunnelMonitor,
                        ],
                    )
                }
                None => (State::NegotiatingEphemeralPeer(data), vec![]),
            },
            other => (other, vec![]),
        }
    }
}
