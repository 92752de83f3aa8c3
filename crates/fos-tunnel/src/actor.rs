//! Tunnel Actor
//!
//! Owns the [`State`] and serializes every event through one mailbox.
//! Each event is reduced, the new status is published, then the effects
//! run one after the other. Results of effects (planned attempts,
//! negotiated keys, timers) are fed back into the same mailbox, so no
//! two transitions ever interleave.
//!
//! ```text
//!   ActorHandle ──┐
//!   driver ───────┼──▶ mailbox ──▶ reduce ──▶ effects ──▶ TunnelDriver
//!   timers ───────┘                  │           │
//!                                    ▼           └──▶ mailbox (feedback)
//!                              watch<TunnelStatus>
//! ```

use crate::config::{ActorTimings, SettingsReader};
use crate::connection::{ConnectionPlanner, TunnelConfiguration};
use crate::directory::SharedDirectory;
use crate::driver::TunnelDriver;
use crate::obfuscation::ObfuscationBypass;
use crate::reducer::{
    Effect, Event, MonitorEvent, NextRelaySelection, ReconnectReason, StartOptions,
};
use crate::state::{BlockedStateReason, KeyPolicy, State, TaskHandle, TunnelStatus};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Actor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    #[error("Tunnel actor has shut down")]
    Closed,
}

/// Cloneable handle for sending events to the actor and observing it
#[derive(Clone)]
pub struct ActorHandle {
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<TunnelStatus>,
}

impl ActorHandle {
    pub fn send(&self, event: Event) -> Result<(), ActorError> {
        self.tx.send(event).map_err(|_| ActorError::Closed)
    }

    pub fn start(&self, options: StartOptions) -> Result<(), ActorError> {
        self.send(Event::Start(options))
    }

    pub fn stop(&self) -> Result<(), ActorError> {
        self.send(Event::Stop)
    }

    /// User-initiated reconnect
    pub fn reconnect(&self, selection: NextRelaySelection) -> Result<(), ActorError> {
        self.send(Event::Reconnect {
            selection,
            reason: ReconnectReason::UserInitiated,
        })
    }

    pub fn monitor(&self, event: MonitorEvent) -> Result<(), ActorError> {
        self.send(Event::Monitor(event))
    }

    pub fn notify_key_rotated(&self, date: DateTime<Utc>) -> Result<(), ActorError> {
        self.send(Event::NotifyKeyRotated(date))
    }

    pub fn switch_key(&self) -> Result<(), ActorError> {
        self.send(Event::SwitchKey)
    }

    /// Latest published status
    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status.clone()
    }

    /// Handle wired to a bare mailbox, for exercising senders in isolation
    #[cfg(test)]
    pub(crate) fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<Event>,
        watch::Sender<TunnelStatus>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(TunnelStatus::default());
        (Self { tx, status }, rx, status_tx)
    }

    /// Wait until the published status satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&TunnelStatus) -> bool,
    ) -> Result<TunnelStatus, ActorError> {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| ActorError::Closed)?;
        Ok(matched.clone())
    }
}

/// Executor side of the actor
pub struct TunnelActor<D: TunnelDriver> {
    state: State,
    driver: Arc<D>,
    settings: Arc<dyn SettingsReader>,
    directory: Arc<SharedDirectory>,
    bypass: Arc<dyn ObfuscationBypass>,
    timings: ActorTimings,
    handle: ActorHandle,
    status_tx: watch::Sender<TunnelStatus>,
    rng: StdRng,
    recovery_timer: Option<AbortHandle>,
    next_task_id: u64,
}

impl<D: TunnelDriver> TunnelActor<D> {
    /// Spawn the actor on the current runtime.
    ///
    /// The actor stops once it reaches the disconnected state; the join
    /// handle completes then.
    pub fn spawn(
        driver: Arc<D>,
        settings: Arc<dyn SettingsReader>,
        directory: Arc<SharedDirectory>,
        bypass: Arc<dyn ObfuscationBypass>,
        timings: ActorTimings,
    ) -> (ActorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TunnelStatus::default());
        let handle = ActorHandle {
            tx,
            status: status_rx,
        };

        let actor = Self {
            state: State::Initial,
            driver,
            settings,
            directory,
            bypass,
            timings,
            handle: handle.clone(),
            status_tx,
            rng: StdRng::from_entropy(),
            recovery_timer: None,
            next_task_id: 0,
        };

        let task = tokio::spawn(actor.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!("Tunnel actor started");

        while let Some(event) = rx.recv().await {
            let state = std::mem::take(&mut self.state);
            let (next, effects) = state.reduce(&event);
            self.state = next;
            self.status_tx.send_replace(self.state.status());

            for effect in effects {
                self.execute(effect).await;
            }

            if matches!(self.state, State::Disconnected) {
                break;
            }
        }

        self.abort_recovery_timer();
        info!("Tunnel actor stopped");
    }

    /// Queue an event behind the ones already in the mailbox
    fn feed(&self, event: Event) {
        if self.handle.send(event).is_err() {
            warn!("Dropping event, mailbox closed");
        }
    }

    async fn execute(&mut self, effect: Effect) {
        debug!("Executing {:?}", effect);
        match effect {
            Effect::StartDefaultPathObserver => {
                self.driver.start_path_observer(self.handle.clone()).await
            }
            Effect::StopDefaultPathObserver => self.driver.stop_path_observer().await,
            Effect::StartTunnelMonitor => {
                self.driver.start_tunnel_monitor(self.handle.clone()).await
            }
            Effect::StopTunnelMonitor => self.driver.stop_tunnel_monitor().await,
            Effect::StartConnection(selection) => self.prepare(&selection, None),
            Effect::RestartConnection(selection, reason) => self.prepare(&selection, Some(reason)),
            Effect::StopTunnelAdapter => self.driver.stop_adapter().await,
            Effect::SetDisconnectedState => {
                self.abort_recovery_timer();
                if let Some(KeyPolicy::UsePrior(_, task)) = self.state.key_policy() {
                    task.cancel();
                }
                self.feed(Event::DisconnectCompleted);
            }
            Effect::ConfigureForErrorState(reason) => self.enter_blocked_state(reason).await,
            Effect::CacheActiveKey(date) => self.cache_active_key(date),
            Effect::CancelTask(task) => {
                debug!("Cancelling task {}", task.id());
                task.cancel();
            }
            Effect::Reconnect(selection) => self.feed(Event::Reconnect {
                selection,
                reason: ReconnectReason::UserInitiated,
            }),
            Effect::ConfigureTunnel(configuration) | Effect::ActivateEphemeralPeer(configuration) => {
                self.configure(&configuration).await
            }
            Effect::NegotiateEphemeralPeer(configuration) => self.negotiate(*configuration),
        }
    }

    fn prepare(&mut self, selection: &NextRelaySelection, reason: Option<ReconnectReason>) {
        let planner = ConnectionPlanner::new(&*self.settings, &self.directory, &*self.bypass);
        let event = match planner.plan(&self.state, selection, reason, &mut self.rng) {
            Ok(attempt) => {
                info!(
                    "Connecting to {} (attempt {})",
                    attempt.target.configuration.relays, attempt.connection_attempt_count
                );
                Event::ConnectionPrepared(Box::new(attempt))
            }
            Err(reason) => Event::Error(reason),
        };
        self.feed(event);
    }

    async fn configure(&self, configuration: &TunnelConfiguration) {
        if let Err(e) = self.driver.start_adapter(configuration).await {
            error!("{}", e);
            self.feed(Event::Error(BlockedStateReason::TunnelAdapter));
        }
    }

    fn negotiate(&self, configuration: TunnelConfiguration) {
        let driver = Arc::clone(&self.driver);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let event = match driver.negotiate_ephemeral_peer(&configuration).await {
                Ok(key) => Event::EphemeralPeerNegotiated(key),
                Err(e) => {
                    warn!("{}", e);
                    Event::Monitor(MonitorEvent::ConnectionLost)
                }
            };
            send_from_task(&handle, event);
        });
    }

    async fn enter_blocked_state(&mut self, reason: BlockedStateReason) {
        self.driver.stop_tunnel_monitor().await;
        if let Err(e) = self.driver.block_traffic(reason).await {
            error!("{}", e);
        }

        self.abort_recovery_timer();
        if reason.is_recoverable() {
            let interval = self.timings.recovery_interval();
            let handle = self.handle.clone();
            debug!("Retrying in {:?}", interval);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                send_from_task(&handle, Event::RecoveryTimer);
            });
            self.recovery_timer = Some(timer.abort_handle());
        }
    }

    fn abort_recovery_timer(&mut self) {
        if let Some(timer) = self.recovery_timer.take() {
            timer.abort();
        }
    }

    /// Keep the key in use alive for the grace period, then switch
    fn cache_active_key(&mut self, date: DateTime<Utc>) {
        let key = self
            .state
            .connection_data()
            .and_then(|data| data.target.as_ref())
            .map(|target| target.configuration.private_key.clone());
        let Some(key) = key else {
            debug!("Key rotated at {} with no tunnel up", date);
            return;
        };

        self.next_task_id += 1;
        let grace = self.timings.key_grace_period();
        let handle = self.handle.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            send_from_task(&handle, Event::SwitchKey);
        });

        info!("Key rotated at {}, keeping prior key for {:?}", date, grace);
        self.feed(Event::PriorKeyCached {
            key,
            task: TaskHandle::new(self.next_task_id, timer.abort_handle()),
        });
    }
}

/// Report a background result; the actor may have stopped meanwhile
fn send_from_task(handle: &ActorHandle, event: Event) {
    let name = event.name();
    if handle.send(event).is_err() {
        debug!("Dropping {} result, actor stopped", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, StaticSettingsReader};
    use crate::connection::tests::plain_settings;
    use crate::constraint::RelayConstraints;
    use crate::directory::tests::sample_directory;
    use crate::driver::{DriverOperation, SimulatedDriver};
    use crate::location::LocationSelector;
    use crate::obfuscation::{NoBypass, ObfuscationMethod, ObfuscationState};
    use crate::state::StateKind;
    use chrono::TimeZone;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn spawn_with(
        settings: Settings,
        timings: ActorTimings,
    ) -> (SimulatedDriver, ActorHandle, JoinHandle<()>) {
        let driver = SimulatedDriver::new();
        let (handle, task) = TunnelActor::spawn(
            Arc::new(driver.clone()),
            Arc::new(StaticSettingsReader(settings)),
            Arc::new(SharedDirectory::new(sample_directory())),
            Arc::new(NoBypass),
            timings,
        );
        (driver, handle, task)
    }

    async fn wait_for_state(handle: &ActorHandle, state: StateKind) -> TunnelStatus {
        tokio::time::timeout(TIMEOUT, handle.wait_for(|status| status.state == state))
            .await
            .expect("timed out waiting for state")
            .expect("actor closed")
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    fn adapter_starts(driver: &SimulatedDriver) -> usize {
        driver
            .operations()
            .iter()
            .filter(|op| matches!(op, DriverOperation::StartAdapter(..)))
            .count()
    }

    #[tokio::test]
    async fn test_connect_and_stop() {
        let (driver, handle, task) = spawn_with(plain_settings(), ActorTimings::default());

        handle.start(StartOptions::default()).unwrap();
        let status = wait_for_state(&handle, StateKind::Connected).await;
        assert!(status.tunnel_relays.is_some());
        assert!(status.is_network_reachable);
        assert!(driver.is_adapter_up());

        handle.stop().unwrap();
        wait_for_state(&handle, StateKind::Disconnected).await;
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();

        let operations = driver.operations();
        assert!(operations.contains(&DriverOperation::StopAdapter));
        assert!(operations.contains(&DriverOperation::StopPathObserver));
        assert!(!driver.is_adapter_up());
        assert_eq!(handle.stop(), Err(ActorError::Closed));
    }

    #[tokio::test]
    async fn test_adapter_failure_blocks_traffic() {
        let timings = ActorTimings {
            recovery_interval_secs: 60,
            ..ActorTimings::default()
        };
        let (driver, handle, _task) = spawn_with(plain_settings(), timings);
        driver.fail_adapter(true);

        handle.start(StartOptions::default()).unwrap();
        let status = wait_for_state(&handle, StateKind::Error).await;

        assert_eq!(status.block_state_reason, Some(BlockedStateReason::TunnelAdapter));
        eventually(|| driver.is_blocking()).await;
        assert!(
            driver
                .operations()
                .contains(&DriverOperation::BlockTraffic(BlockedStateReason::TunnelAdapter))
        );
    }

    #[tokio::test]
    async fn test_recovers_from_adapter_failure() {
        let timings = ActorTimings {
            recovery_interval_secs: 0,
            ..ActorTimings::default()
        };
        let (driver, handle, _task) = spawn_with(plain_settings(), timings);
        driver.fail_adapter(true);

        handle.start(StartOptions::default()).unwrap();
        wait_for_state(&handle, StateKind::Error).await;

        driver.fail_adapter(false);
        wait_for_state(&handle, StateKind::Connected).await;
        assert!(!driver.is_blocking());
    }

    #[tokio::test]
    async fn test_no_matching_relay_is_not_retried() {
        let mut settings = plain_settings();
        settings.tunnel.relay_constraints =
            RelayConstraints::with_location(LocationSelector::country("jp"));
        let timings = ActorTimings {
            recovery_interval_secs: 0,
            ..ActorTimings::default()
        };
        let (driver, handle, _task) = spawn_with(settings, timings);

        handle.start(StartOptions::default()).unwrap();
        let status = wait_for_state(&handle, StateKind::Error).await;
        assert_eq!(
            status.block_state_reason,
            Some(BlockedStateReason::NoRelaysSatisfyingConstraints)
        );

        eventually(|| driver.is_blocking()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(adapter_starts(&driver), 0);
        assert_eq!(handle.status().state, StateKind::Error);
    }

    #[tokio::test]
    async fn test_connection_loss_reconnects() {
        let (driver, handle, _task) = spawn_with(plain_settings(), ActorTimings::default());

        handle.start(StartOptions::default()).unwrap();
        wait_for_state(&handle, StateKind::Connected).await;

        driver.simulate_connection_loss();
        eventually(|| adapter_starts(&driver) == 2).await;
        let status = wait_for_state(&handle, StateKind::Connected).await;
        assert_eq!(status.number_of_failed_attempts, 0);
    }

    #[tokio::test]
    async fn test_reachability_reported() {
        let (driver, handle, _task) = spawn_with(plain_settings(), ActorTimings::default());

        handle.start(StartOptions::default()).unwrap();
        wait_for_state(&handle, StateKind::Connected).await;

        driver.simulate_reachability(false);
        let status = tokio::time::timeout(TIMEOUT, handle.wait_for(|s| !s.is_network_reachable))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, StateKind::Connected);
    }

    #[tokio::test]
    async fn test_key_rotation_reconnects_after_grace() {
        let timings = ActorTimings {
            key_grace_period_secs: 0,
            ..ActorTimings::default()
        };
        let (driver, handle, _task) = spawn_with(plain_settings(), timings);
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        handle.start(StartOptions::default()).unwrap();
        wait_for_state(&handle, StateKind::Connected).await;

        handle.notify_key_rotated(date).unwrap();
        eventually(|| adapter_starts(&driver) == 2).await;
        let status = wait_for_state(&handle, StateKind::Connected).await;
        assert_eq!(status.last_key_rotation, Some(date));
    }

    #[tokio::test]
    async fn test_ephemeral_peer_negotiated_before_connecting() {
        let mut settings = plain_settings();
        settings.tunnel.post_quantum = true;
        let (driver, handle, _task) = spawn_with(settings, ActorTimings::default());

        handle.start(StartOptions::default()).unwrap();
        wait_for_state(&handle, StateKind::Connected).await;

        let operations = driver.operations();
        let negotiated = operations
            .iter()
            .position(|op| *op == DriverOperation::NegotiateEphemeralPeer)
            .unwrap();
        let last_start = operations
            .iter()
            .rposition(|op| matches!(op, DriverOperation::StartAdapter(..)))
            .unwrap();
        assert!(negotiated < last_start);
        assert_eq!(adapter_starts(&driver), 2);
    }

    #[tokio::test]
    async fn test_adapter_failures_rotate_obfuscation() {
        let mut settings = plain_settings();
        settings.tunnel.obfuscation.state = ObfuscationState::Automatic;
        let timings = ActorTimings {
            recovery_interval_secs: 0,
            ..ActorTimings::default()
        };
        let (driver, handle, _task) = spawn_with(settings, timings);
        driver.fail_adapter(true);

        handle.start(StartOptions::default()).unwrap();
        let status = tokio::time::timeout(
            TIMEOUT,
            handle.wait_for(|s| s.state == StateKind::Error && s.number_of_failed_attempts >= 3),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.block_state_reason, Some(BlockedStateReason::TunnelAdapter));

        let methods: Vec<_> = driver
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                DriverOperation::StartAdapter(_, method) => Some(method),
                _ => None,
            })
            .take(4)
            .collect();
        assert_eq!(
            methods,
            vec![
                ObfuscationMethod::Off,
                ObfuscationMethod::Off,
                ObfuscationMethod::Shadowsocks,
                ObfuscationMethod::UdpOverTcp,
            ]
        );

        driver.fail_adapter(false);
        let status = wait_for_state(&handle, StateKind::Connected).await;
        assert_eq!(status.number_of_failed_attempts, 0);
    }

    #[tokio::test]
    async fn test_error_after_stop_then_stop_again() {
        let (driver, handle, task) = spawn_with(plain_settings(), ActorTimings::default());

        handle.start(StartOptions::default()).unwrap();
        wait_for_state(&handle, StateKind::Connected).await;

        handle.stop().unwrap();
        handle.send(Event::Error(BlockedStateReason::TunnelAdapter)).unwrap();
        handle.stop().unwrap();
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();

        assert_eq!(handle.status().state, StateKind::Disconnected);
        let operations = driver.operations();
        let stops = operations
            .iter()
            .filter(|op| **op == DriverOperation::StopAdapter)
            .count();
        assert_eq!(stops, 1);
        assert!(!operations.iter().any(|op| matches!(op, DriverOperation::BlockTraffic(_))));
        assert!(!driver.is_adapter_up());
    }

    #[tokio::test]
    async fn test_stop_from_error_twice() {
        let timings = ActorTimings {
            recovery_interval_secs: 60,
            ..ActorTimings::default()
        };
        let (driver, handle, task) = spawn_with(plain_settings(), timings);

        handle.start(StartOptions::default()).unwrap();
        wait_for_state(&handle, StateKind::Connected).await;
        handle.send(Event::Error(BlockedStateReason::DeviceLocked)).unwrap();
        wait_for_state(&handle, StateKind::Error).await;

        handle.stop().unwrap();
        handle.stop().unwrap();
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();

        assert_eq!(handle.status().state, StateKind::Disconnected);
        assert!(!driver.is_blocking());
        assert!(!driver.is_adapter_up());
    }

    #[tokio::test]
    async fn test_negotiation_failure_restarts_attempt() {
        let mut settings = plain_settings();
        settings.tunnel.post_quantum = true;
        let (driver, handle, _task) = spawn_with(settings, ActorTimings::default());
        driver.fail_negotiation(true);

        handle.start(StartOptions::default()).unwrap();
        let status = tokio::time::timeout(
            TIMEOUT,
            handle.wait_for(|s| {
                s.state == StateKind::NegotiatingEphemeralPeer && s.number_of_failed_attempts >= 2
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.block_state_reason, None);

        driver.fail_negotiation(false);
        let status = wait_for_state(&handle, StateKind::Connected).await;
        assert_eq!(status.number_of_failed_attempts, 0);

        let negotiations = driver
            .operations()
            .iter()
            .filter(|op| **op == DriverOperation::NegotiateEphemeralPeer)
            .count();
        assert!(negotiations >= 3);
    }
}
