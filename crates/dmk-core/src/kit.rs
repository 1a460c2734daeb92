//! The device management kit: one explicitly built context owning
//! discovery, sessions, dispatch and state monitoring.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::command::Command;
use crate::config::DmkConfig;
use crate::device::{DeviceDescriptor, DeviceId, DeviceState};
use crate::discovery::{DeviceSnapshot, DiscoveryService, DiscoveryStream};
use crate::dispatcher::CommandDispatcher;
use crate::error::Result;
use crate::events::{DmkObserver, ObserverSet, TracingObserver};
use crate::monitor::{DeviceStateStream, StateMonitor};
use crate::protocol::{ApduCommand, ApduResponse};
use crate::session::{Session, SessionId, SessionManager, SessionState};
use crate::transport::Transport;

/// Registers transports and observers, then builds the kit.
#[derive(Default)]
pub struct DeviceManagementKitBuilder {
    transports: Vec<Arc<dyn Transport>>,
    observers: Vec<Arc<dyn DmkObserver>>,
    config: DmkConfig,
}

impl DeviceManagementKitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// Register an event observer. Without any, events go to [`TracingObserver`].
    pub fn add_observer(mut self, observer: Arc<dyn DmkObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_config(mut self, config: DmkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> DeviceManagementKit {
        let observer: Arc<dyn DmkObserver> = if self.observers.is_empty() {
            Arc::new(TracingObserver)
        } else {
            Arc::new(ObserverSet::new(self.observers))
        };
        info!(
            transports = self.transports.len(),
            timeout_ms = self.config.command_timeout_ms,
            "Building device management kit"
        );

        let discovery = Arc::new(DiscoveryService::new(
            self.transports,
            Arc::clone(&observer),
            self.config.discovery_poll_interval(),
        ));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&discovery), observer));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&sessions),
            self.config.command_timeout(),
        ));
        let monitor = StateMonitor::new(
            Arc::clone(&sessions),
            Arc::clone(&dispatcher),
            self.config.state_poll_interval(),
        );

        DeviceManagementKit {
            config: self.config,
            discovery,
            sessions,
            dispatcher,
            monitor,
        }
    }
}

/// Entry point for hosts. Build once at startup, [`close`](Self::close) at
/// shutdown.
pub struct DeviceManagementKit {
    config: DmkConfig,
    discovery: Arc<DiscoveryService>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<CommandDispatcher>,
    monitor: StateMonitor,
}

impl DeviceManagementKit {
    pub fn builder() -> DeviceManagementKitBuilder {
        DeviceManagementKitBuilder::new()
    }

    pub fn config(&self) -> &DmkConfig {
        &self.config
    }

    // ---- Discovery ----

    /// Unbounded stream of device snapshots.
    pub fn listen_to_available_devices(&self) -> DiscoveryStream {
        self.discovery.listen()
    }

    /// Observe for the configured window and return the devices without a
    /// session.
    pub async fn available_devices(&self) -> DeviceSnapshot {
        let last = self
            .discovery
            .listen_for(self.config.observation_window())
            .last()
            .await
            .unwrap_or_default();
        self.filter_unconnected(&last)
    }

    pub fn filter_unconnected(&self, snapshot: &DeviceSnapshot) -> DeviceSnapshot {
        snapshot.filter_unconnected(&self.sessions.connected_ids())
    }

    // ---- Sessions ----

    pub async fn connect(&self, device: &DeviceDescriptor) -> Result<Session> {
        self.sessions.connect(device).await
    }

    pub fn get_connected_device(&self, session_id: SessionId) -> Result<DeviceDescriptor> {
        self.sessions.get_connected_device(session_id)
    }

    pub async fn disconnect(&self, session_id: SessionId) -> Result<()> {
        self.sessions.disconnect(session_id).await
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.sessions()
    }

    pub fn connected_ids(&self) -> HashSet<DeviceId> {
        self.sessions.connected_ids()
    }

    pub fn session_state(&self, session_id: SessionId) -> Result<SessionState> {
        self.sessions.session_state(session_id)
    }

    pub fn device_session_state(&self, device_id: &DeviceId) -> SessionState {
        self.sessions.device_state(device_id)
    }

    // ---- Commands ----

    pub async fn send_apdu(&self, session_id: SessionId, command: &ApduCommand) -> Result<ApduResponse> {
        self.dispatcher.send_apdu(session_id, command).await
    }

    pub async fn send_command<C: Command>(&self, session_id: SessionId, command: &C) -> Result<C::Output> {
        self.dispatcher.send_command(session_id, command).await
    }

    pub async fn exchange(&self, session_id: SessionId, command: &ApduCommand) -> Result<ApduResponse> {
        self.dispatcher.exchange(session_id, command).await
    }

    // ---- Device state ----

    /// Stream of device state updates for a connected session.
    pub fn get_device_session_state(&self, session_id: SessionId) -> Result<DeviceStateStream> {
        self.monitor.observe(session_id)
    }

    pub async fn refresh_device_state(&self, session_id: SessionId) -> Result<DeviceState> {
        self.monitor.refresh(session_id).await
    }

    // ---- Components ----

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &StateMonitor {
        &self.monitor
    }

    /// Close every session. The kit stays usable afterwards.
    pub async fn close(&self) -> Result<()> {
        info!(sessions = self.sessions.sessions().len(), "Closing device management kit");
        self.sessions.close_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GetAppAndVersion;
    use crate::device::{DeviceModelId, TransportKind};
    use crate::events::DmkEvent;
    use crate::transport::MockTransport;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DmkEvent>>);

    impl DmkObserver for Recorder {
        fn on_event(&self, event: &DmkEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn fast_config() -> DmkConfig {
        DmkConfig {
            discovery_poll_interval_ms: 5,
            observation_window_ms: 50,
            state_poll_interval_ms: 10,
            command_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_available_devices_skips_connected() {
        let mock = MockTransport::new();
        let a = DeviceDescriptor::new("a", "Nano X", TransportKind::Simulated, DeviceModelId::NanoX);
        let b = DeviceDescriptor::new("b", "Flex", TransportKind::Simulated, DeviceModelId::Flex);
        mock.add_device(a.clone());
        mock.add_device(b.clone());
        let dmk = DeviceManagementKit::builder()
            .add_transport(mock.clone())
            .with_config(fast_config())
            .build();

        assert_eq!(dmk.available_devices().await.len(), 2);
        dmk.connect(&a).await.unwrap();
        let left = dmk.available_devices().await;
        assert_eq!(left.devices(), &[b]);
    }

    #[tokio::test]
    async fn test_events_reach_observers() {
        let mock = MockTransport::new();
        let device = DeviceDescriptor::new("a", "Nano X", TransportKind::Simulated, DeviceModelId::NanoX);
        mock.add_device(device.clone());
        let recorder = Arc::new(Recorder::default());
        let dmk = DeviceManagementKit::builder()
            .add_transport(mock)
            .add_observer(recorder.clone())
            .with_config(fast_config())
            .build();

        let session = dmk.connect(&device).await.unwrap();
        dmk.send_command(session.id(), &GetAppAndVersion).await.unwrap();
        dmk.close().await.unwrap();
        assert!(dmk.sessions().is_empty());

        let events = recorder.0.lock().unwrap();
        assert!(matches!(events[0], DmkEvent::Connecting { .. }));
        assert!(matches!(events[1], DmkEvent::SessionOpened { .. }));
        let packets = events
            .iter()
            .filter(|e| matches!(e, DmkEvent::Packet { .. }))
            .count();
        assert_eq!(packets, 2);
        assert!(matches!(
            events.last(),
            Some(DmkEvent::SessionClosed {
                reason: crate::events::CloseReason::Shutdown,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_state_stream_through_kit() {
        let mock = MockTransport::new();
        let device = DeviceDescriptor::new("a", "Stax", TransportKind::Simulated, DeviceModelId::Stax);
        mock.add_device(device.clone());
        let dmk = DeviceManagementKit::builder()
            .add_transport(mock)
            .with_config(fast_config())
            .build();

        let session = dmk.connect(&device).await.unwrap();
        let mut states = dmk.get_device_session_state(session.id()).unwrap();
        let first = states.next().await.unwrap();
        assert_eq!(first.state.device_model_id, DeviceModelId::Stax);

        let with_battery = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let change = states.next().await.unwrap();
                if change.state.battery_status.is_some() {
                    return change;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(with_battery.state.battery_status.unwrap().level, 100);

        dmk.disconnect(session.id()).await.unwrap();
        assert!(states.next().await.is_none());
    }
}
