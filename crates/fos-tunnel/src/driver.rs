//! Tunnel Driver
//!
//! The platform side of the actor: the WireGuard adapter, the traffic
//! block used in the error state, the tunnel monitor and the default path
//! observer. Monitors report back through the [`ActorHandle`] they are
//! started with.
//!
//! [`SimulatedDriver`] performs no I/O. It records every operation, acts
//! as a kill switch while blocked and reports the connection as
//! established when the monitor starts on an adapter that is up.

use crate::actor::ActorHandle;
use crate::connection::TunnelConfiguration;
use crate::keys::PrivateKey;
use crate::obfuscation::ObfuscationMethod;
use crate::reducer::MonitorEvent;
use crate::state::BlockedStateReason;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Adapter errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("Failed to start tunnel adapter: {0}")]
    StartFailed(String),

    #[error("Failed to block traffic: {0}")]
    BlockFailed(String),

    #[error("Ephemeral peer negotiation failed: {0}")]
    NegotiationFailed(String),
}

/// Operations the actor needs from the platform
pub trait TunnelDriver: Send + Sync + 'static {
    /// Bring the adapter up with `configuration`, replacing any previous one
    fn start_adapter(
        &self,
        configuration: &TunnelConfiguration,
    ) -> impl Future<Output = Result<(), AdapterError>> + Send;

    fn stop_adapter(&self) -> impl Future<Output = ()> + Send;

    /// Drop all traffic while the tunnel is blocked
    fn block_traffic(
        &self,
        reason: BlockedStateReason,
    ) -> impl Future<Output = Result<(), AdapterError>> + Send;

    /// Start (or restart) watching the tunnel for establishment and loss
    fn start_tunnel_monitor(&self, events: ActorHandle) -> impl Future<Output = ()> + Send;

    fn stop_tunnel_monitor(&self) -> impl Future<Output = ()> + Send;

    /// Start reporting network reachability changes
    fn start_path_observer(&self, events: ActorHandle) -> impl Future<Output = ()> + Send;

    fn stop_path_observer(&self) -> impl Future<Output = ()> + Send;

    /// Negotiate a post-quantum / DAITA peer through the configured tunnel
    fn negotiate_ephemeral_peer(
        &self,
        configuration: &TunnelConfiguration,
    ) -> impl Future<Output = Result<PrivateKey, AdapterError>> + Send;
}

/// Operation recorded by [`SimulatedDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOperation {
    /// Ingress hostname and the obfuscation in front of it
    StartAdapter(String, ObfuscationMethod),
    StopAdapter,
    BlockTraffic(BlockedStateReason),
    StartTunnelMonitor,
    StopTunnelMonitor,
    StartPathObserver,
    StopPathObserver,
    NegotiateEphemeralPeer,
}

#[derive(Default)]
struct SimulatedInner {
    monitor: Option<ActorHandle>,
    path_observer: Option<ActorHandle>,
    adapter_up: bool,
    blocked: Option<BlockedStateReason>,
    operations: Vec<DriverOperation>,
    fail_adapter: bool,
    fail_negotiation: bool,
}

/// In-process driver for the daemon's dry-run mode and for tests
#[derive(Clone, Default)]
pub struct SimulatedDriver {
    inner: Arc<Mutex<SimulatedInner>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent adapter starts fail
    pub fn fail_adapter(&self, fail: bool) {
        self.lock().fail_adapter = fail;
    }

    /// Make subsequent negotiations fail
    pub fn fail_negotiation(&self, fail: bool) {
        self.lock().fail_negotiation = fail;
    }

    pub fn operations(&self) -> Vec<DriverOperation> {
        self.lock().operations.clone()
    }

    pub fn is_blocking(&self) -> bool {
        self.lock().blocked.is_some()
    }

    pub fn is_adapter_up(&self) -> bool {
        self.lock().adapter_up
    }

    /// Report a lost connection, as a real tunnel monitor would
    pub fn simulate_connection_loss(&self) {
        let inner = self.lock();
        if let Some(monitor) = &inner.monitor {
            warn!("Simulated connection loss");
            let _ = monitor.monitor(MonitorEvent::ConnectionLost);
        }
    }

    /// Report a reachability change, as a real path observer would
    pub fn simulate_reachability(&self, reachable: bool) {
        let inner = self.lock();
        if let Some(observer) = &inner.path_observer {
            let _ = observer.monitor(MonitorEvent::NetworkReachabilityChanged(reachable));
        }
    }
}

impl TunnelDriver for SimulatedDriver {
    async fn start_adapter(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError> {
        let mut inner = self.lock();
        let ingress = configuration.relays.ingress();
        inner
            .operations
            .push(DriverOperation::StartAdapter(
                ingress.hostname().to_string(),
                configuration.relays.obfuscation,
            ));

        if inner.fail_adapter {
            return Err(AdapterError::StartFailed("simulated failure".to_string()));
        }

        info!(
            "Adapter up: {} via {} {} (key {})",
            configuration.relays,
            ingress.endpoint.transport,
            ingress.endpoint.socket_address,
            configuration.active_key().public_key()
        );
        inner.adapter_up = true;
        inner.blocked = None;
        Ok(())
    }

    async fn stop_adapter(&self) {
        let mut inner = self.lock();
        inner.operations.push(DriverOperation::StopAdapter);
        inner.adapter_up = false;
        inner.blocked = None;
        debug!("Adapter down");
    }

    async fn block_traffic(&self, reason: BlockedStateReason) -> Result<(), AdapterError> {
        let mut inner = self.lock();
        inner.operations.push(DriverOperation::BlockTraffic(reason));
        inner.adapter_up = false;
        inner.blocked = Some(reason);
        warn!("Blocking traffic: {}", reason);
        Ok(())
    }

    async fn start_tunnel_monitor(&self, events: ActorHandle) {
        let mut inner = self.lock();
        inner.operations.push(DriverOperation::StartTunnelMonitor);
        if inner.adapter_up {
            let _ = events.monitor(MonitorEvent::ConnectionEstablished);
        }
        inner.monitor = Some(events);
    }

    async fn stop_tunnel_monitor(&self) {
        let mut inner = self.lock();
        inner.operations.push(DriverOperation::StopTunnelMonitor);
        inner.monitor = None;
    }

    async fn start_path_observer(&self, events: ActorHandle) {
        let mut inner = self.lock();
        inner.operations.push(DriverOperation::StartPathObserver);
        let _ = events.monitor(MonitorEvent::NetworkReachabilityChanged(true));
        inner.path_observer = Some(events);
    }

    async fn stop_path_observer(&self) {
        let mut inner = self.lock();
        inner.operations.push(DriverOperation::StopPathObserver);
        inner.path_observer = None;
    }

    async fn negotiate_ephemeral_peer(
        &self,
        _configuration: &TunnelConfiguration,
    ) -> Result<PrivateKey, AdapterError> {
        let mut inner = self.lock();
        inner.operations.push(DriverOperation::NegotiateEphemeralPeer);
        if inner.fail_negotiation {
            return Err(AdapterError::NegotiationFailed("simulated failure".to_string()));
        }
        Ok(PrivateKey::generate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::prepared_attempt;
    use crate::reducer::Event;

    #[tokio::test]
    async fn test_monitor_reports_established_only_when_up() {
        let driver = SimulatedDriver::new();
        let (handle, mut events, _status) = ActorHandle::detached();

        driver.start_tunnel_monitor(handle.clone()).await;
        assert!(events.try_recv().is_err());

        let configuration = prepared_attempt().target.configuration;
        driver.start_adapter(&configuration).await.unwrap();
        driver.start_tunnel_monitor(handle).await;
        assert_eq!(
            events.try_recv().unwrap(),
            Event::Monitor(MonitorEvent::ConnectionEstablished)
        );

        driver.simulate_connection_loss();
        assert_eq!(events.try_recv().unwrap(), Event::Monitor(MonitorEvent::ConnectionLost));
    }

    #[tokio::test]
    async fn test_block_and_restart() {
        let driver = SimulatedDriver::new();
        let configuration = prepared_attempt().target.configuration;

        driver.block_traffic(BlockedStateReason::DeviceLocked).await.unwrap();
        assert!(driver.is_blocking());
        assert!(!driver.is_adapter_up());

        driver.start_adapter(&configuration).await.unwrap();
        assert!(!driver.is_blocking());
        assert!(driver.is_adapter_up());

        driver.fail_adapter(true);
        assert!(driver.start_adapter(&configuration).await.is_err());
        assert_eq!(
            driver.operations()[0],
            DriverOperation::BlockTraffic(BlockedStateReason::DeviceLocked)
        );
    }

    #[tokio::test]
    async fn test_stops_are_idempotent() {
        let driver = SimulatedDriver::new();
        let (handle, mut events, _status) = ActorHandle::detached();
        let configuration = prepared_attempt().target.configuration;

        driver.start_adapter(&configuration).await.unwrap();
        driver.start_tunnel_monitor(handle.clone()).await;
        driver.start_path_observer(handle).await;
        while events.try_recv().is_ok() {}

        for _ in 0..2 {
            driver.stop_tunnel_monitor().await;
            driver.stop_path_observer().await;
            driver.stop_adapter().await;
        }
        assert!(!driver.is_adapter_up());
        assert!(!driver.is_blocking());

        // Blocking after the stop, then stopping again, leaves nothing running
        driver.block_traffic(BlockedStateReason::TunnelAdapter).await.unwrap();
        driver.stop_adapter().await;
        assert!(!driver.is_blocking());
        assert!(!driver.is_adapter_up());

        // Nothing is left to report through
        driver.simulate_connection_loss();
        driver.simulate_reachability(false);
        assert!(events.try_recv().is_err());
        let stops = driver
            .operations()
            .iter()
            .filter(|op| **op == DriverOperation::StopAdapter)
            .count();
        assert_eq!(stops, 3);
    }

    #[tokio::test]
    async fn test_negotiation_failure() {
        let driver = SimulatedDriver::new();
        let configuration = prepared_attempt().target.configuration;

        assert!(driver.negotiate_ephemeral_peer(&configuration).await.is_ok());
        driver.fail_negotiation(true);
        assert!(matches!(
            driver.negotiate_ephemeral_peer(&configuration).await,
            Err(AdapterError::NegotiationFailed(_))
        ));
    }
}
