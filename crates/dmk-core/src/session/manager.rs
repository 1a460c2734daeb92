//! Session registry and the connect/disconnect state machine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::state::SessionState;
use super::{Session, SessionId};
use crate::device::{DeviceDescriptor, DeviceId, DeviceState};
use crate::discovery::DiscoveryService;
use crate::error::{DmkError, Result};
use crate::events::{CloseReason, DmkEvent, DmkObserver};
use crate::sync::lock;
use crate::transport::{Channel, ObservableChannel, TransportError};

/// Everything the kit keeps for one live session.
pub(crate) struct SessionEntry {
    session: Session,
    /// The device channel; holding the lock is holding the session queue.
    pub(crate) channel: Arc<tokio::sync::Mutex<Box<dyn Channel>>>,
    lifecycle: watch::Sender<SessionState>,
    pub(crate) device_state: watch::Sender<DeviceState>,
    /// State refresh task, while someone observes the device.
    pub(crate) refresher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    fn new(session: Session, channel: Box<dyn Channel>) -> Self {
        let (lifecycle, _) = watch::channel(SessionState::Connecting);
        let (device_state, _) = watch::channel(DeviceState::new(session.device().model_id));
        Self {
            session,
            channel: Arc::new(tokio::sync::Mutex::new(channel)),
            lifecycle,
            device_state,
            refresher: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.session.id()
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.lifecycle.borrow()
    }

    pub(crate) fn subscribe_lifecycle(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.subscribe()
    }

    fn goto(&self, next: SessionState) {
        let prev = self.lifecycle.send_replace(next);
        if prev.can_transition_to(next) {
            info!(session = %self.id(), from = %prev, to = %next, "Session state transition");
        } else {
            warn!(session = %self.id(), from = %prev, to = %next, "Unexpected session state transition");
        }
    }

    /// Stop accepting commands. Returns false if teardown already started.
    fn begin_teardown(&self) -> bool {
        let started = self.lifecycle.send_if_modified(|state| {
            if state.is_connected() {
                *state = SessionState::Disconnecting;
                true
            } else {
                false
            }
        });
        if started {
            info!(session = %self.id(), "Session state transition: CONNECTED -> DISCONNECTING");
        }
        started
    }
}

/// Marks a device as connecting until dropped.
struct PendingConnect<'a> {
    connecting: &'a Mutex<HashSet<DeviceId>>,
    device_id: DeviceId,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        lock(self.connecting).remove(&self.device_id);
    }
}

/// Owns the connect/disconnect lifecycle and the registry of live sessions.
///
/// The registry lock is only held for map operations, never across an
/// await; removal is a single atomic take, so two disconnects of the same
/// session cannot both proceed.
pub struct SessionManager {
    discovery: Arc<DiscoveryService>,
    observer: Arc<dyn DmkObserver>,
    registry: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    connecting: Mutex<HashSet<DeviceId>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(discovery: Arc<DiscoveryService>, observer: Arc<dyn DmkObserver>) -> Self {
        Self {
            discovery,
            observer,
            registry: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn observer(&self) -> &Arc<dyn DmkObserver> {
        &self.observer
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<SessionEntry>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<SessionEntry>>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_by_device(&self, device_id: &DeviceId) -> Option<Arc<SessionEntry>> {
        self.registry()
            .values()
            .find(|e| &e.session.device().id == device_id)
            .cloned()
    }

    fn begin_connect(&self, device_id: &DeviceId) -> Result<PendingConnect<'_>> {
        // Connecting lock first: a finished connect is registered before it
        // leaves the connecting set.
        let mut connecting = lock(&self.connecting);
        if let Some(entry) = self.find_by_device(device_id) {
            return Err(DmkError::AlreadyConnected {
                device_id: device_id.clone(),
                session_id: entry.id(),
            });
        }
        if !connecting.insert(device_id.clone()) {
            return Err(DmkError::ConnectInProgress(device_id.clone()));
        }
        Ok(PendingConnect {
            connecting: &self.connecting,
            device_id: device_id.clone(),
        })
    }

    async fn open_channel(&self, device: &DeviceDescriptor) -> Result<Box<dyn Channel>, TransportError> {
        let transport = self.discovery.locate(device).await?;
        transport.open(device).await
    }

    /// Open a session on `device`.
    ///
    /// On failure the device stays discoverable and may be retried.
    #[instrument(level = "info", skip(self, device), fields(device = %device.id))]
    pub async fn connect(&self, device: &DeviceDescriptor) -> Result<Session> {
        let _pending = self.begin_connect(&device.id)?;
        debug!(from = %SessionState::Discovered, to = %SessionState::Connecting, "Connecting");
        self.observer.on_event(&DmkEvent::Connecting {
            device_id: device.id.clone(),
        });

        let channel = match self.open_channel(device).await {
            Ok(channel) => channel,
            Err(source) => {
                warn!(error = %source, "Connection failed, device back to DISCOVERED");
                self.observer.on_event(&DmkEvent::ConnectFailed {
                    device_id: device.id.clone(),
                    reason: source.to_string(),
                });
                return Err(DmkError::Connection {
                    device_id: device.id.clone(),
                    source,
                });
            }
        };

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let channel = Box::new(ObservableChannel::new(channel, Arc::clone(&self.observer), id));
        let session = Session::new(id, device.clone());
        let entry = Arc::new(SessionEntry::new(session.clone(), channel));
        entry.goto(SessionState::Connected);
        self.registry_mut().insert(id, entry);

        self.observer.on_event(&DmkEvent::SessionOpened {
            session_id: id,
            device_id: device.id.clone(),
        });
        Ok(session)
    }

    pub(crate) fn entry(&self, session_id: SessionId) -> Result<Arc<SessionEntry>> {
        self.registry()
            .get(&session_id)
            .cloned()
            .ok_or(DmkError::UnknownSession(session_id))
    }

    pub fn session(&self, session_id: SessionId) -> Result<Session> {
        Ok(self.entry(session_id)?.session.clone())
    }

    pub fn get_connected_device(&self, session_id: SessionId) -> Result<DeviceDescriptor> {
        Ok(self.entry(session_id)?.session.device().clone())
    }

    /// Live sessions, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.registry().values().map(|e| e.session.clone()).collect();
        sessions.sort_by_key(Session::id);
        sessions
    }

    /// Ids of devices that have a live session.
    pub fn connected_ids(&self) -> HashSet<DeviceId> {
        self.registry()
            .values()
            .map(|e| e.session.device().id.clone())
            .collect()
    }

    pub fn session_state(&self, session_id: SessionId) -> Result<SessionState> {
        Ok(self.entry(session_id)?.state())
    }

    /// Lifecycle position of a device, whether or not it has a session.
    pub fn device_state(&self, device_id: &DeviceId) -> SessionState {
        if let Some(entry) = self.find_by_device(device_id) {
            return entry.state();
        }
        if lock(&self.connecting).contains(device_id) {
            SessionState::Connecting
        } else {
            SessionState::Discovered
        }
    }

    fn take(&self, session_id: SessionId) -> Option<Arc<SessionEntry>> {
        self.registry_mut().remove(&session_id)
    }

    /// Close a session.
    ///
    /// Waits for the in-flight command; queued ones fail with
    /// [`DmkError::UnknownSession`]. The session is unregistered even when
    /// the transport fails to close.
    #[instrument(level = "info", skip(self), fields(session = %session_id))]
    pub async fn disconnect(&self, session_id: SessionId) -> Result<()> {
        let entry = self.take(session_id).ok_or(DmkError::UnknownSession(session_id))?;
        entry.begin_teardown();
        let mut channel = entry.channel.lock().await;
        self.finish(&entry, &mut channel, CloseReason::Requested).await
    }

    /// Tear down a session whose channel is already held by the caller.
    pub(crate) async fn drop_session(
        &self,
        entry: &Arc<SessionEntry>,
        channel: &mut Box<dyn Channel>,
        reason: CloseReason,
    ) {
        {
            let mut registry = self.registry_mut();
            if registry
                .get(&entry.id())
                .is_some_and(|registered| Arc::ptr_eq(registered, entry))
            {
                registry.remove(&entry.id());
            }
        }
        entry.begin_teardown();
        if let Err(e) = self.finish(entry, channel, reason).await {
            warn!(session = %entry.id(), error = %e, "Teardown after {} failed", reason);
        }
    }

    async fn finish(&self, entry: &SessionEntry, channel: &mut Box<dyn Channel>, reason: CloseReason) -> Result<()> {
        if entry.state() == SessionState::Closed {
            return Ok(());
        }
        let closed = channel.close().await;
        entry.goto(SessionState::Closed);
        self.observer.on_event(&DmkEvent::SessionClosed {
            session_id: entry.id(),
            reason,
        });
        closed.map_err(|source| DmkError::Disconnection {
            session_id: entry.id(),
            source,
        })
    }

    /// Close every session. Returns the first teardown error, if any.
    pub async fn close_all(&self) -> Result<()> {
        let entries: Vec<Arc<SessionEntry>> = self.registry_mut().drain().map(|(_, e)| e).collect();
        let mut first_error = None;
        for entry in entries {
            entry.begin_teardown();
            let mut channel = entry.channel.lock().await;
            if let Err(e) = self.finish(&entry, &mut channel, CloseReason::Shutdown).await {
                warn!(session = %entry.id(), error = %e, "Shutdown teardown failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceModelId, TransportKind};
    use crate::events::NullObserver;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn device(id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(id, "Nano X", TransportKind::Simulated, DeviceModelId::NanoX)
    }

    fn manager(mock: &MockTransport) -> SessionManager {
        let discovery = DiscoveryService::new(
            vec![Arc::new(mock.clone())],
            Arc::new(NullObserver),
            Duration::from_millis(10),
        );
        SessionManager::new(Arc::new(discovery), Arc::new(NullObserver))
    }

    #[tokio::test]
    async fn test_connect_get_disconnect() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        let sessions = manager(&mock);

        let session = sessions.connect(&device("a")).await.unwrap();
        assert_eq!(sessions.get_connected_device(session.id()).unwrap(), device("a"));
        assert_eq!(sessions.session_state(session.id()).unwrap(), SessionState::Connected);
        assert_eq!(sessions.device_state(&DeviceId::new("a")), SessionState::Connected);
        assert_eq!(mock.open_channels(&DeviceId::new("a")), 1);

        sessions.disconnect(session.id()).await.unwrap();
        assert!(matches!(
            sessions.get_connected_device(session.id()),
            Err(DmkError::UnknownSession(id)) if id == session.id()
        ));
        assert!(matches!(
            sessions.disconnect(session.id()).await,
            Err(DmkError::UnknownSession(_))
        ));
        assert_eq!(mock.open_channels(&DeviceId::new("a")), 0);
        assert_eq!(sessions.device_state(&DeviceId::new("a")), SessionState::Discovered);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        mock.add_device(device("b"));
        let sessions = manager(&mock);

        let first = sessions.connect(&device("a")).await.unwrap();
        let second = sessions.connect(&device("b")).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(sessions.sessions().len(), 2);

        sessions.disconnect(first.id()).await.unwrap();
        let again = sessions.connect(&device("a")).await.unwrap();
        assert!(again.id() > second.id());
        assert_eq!(
            sessions.connected_ids(),
            [DeviceId::new("a"), DeviceId::new("b")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_rejected() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        let sessions = manager(&mock);

        let session = sessions.connect(&device("a")).await.unwrap();
        match sessions.connect(&device("a")).await {
            Err(DmkError::AlreadyConnected { session_id, .. }) => assert_eq!(session_id, session.id()),
            other => panic!("expected AlreadyConnected, got {:?}", other),
        }
        // The existing session is untouched.
        assert_eq!(sessions.sessions(), vec![session]);
        assert_eq!(mock.open_channels(&DeviceId::new("a")), 1);
    }

    #[tokio::test]
    async fn test_connect_in_progress_is_rejected() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        let sessions = manager(&mock);

        let pending = sessions.begin_connect(&DeviceId::new("a")).unwrap();
        assert_eq!(sessions.device_state(&DeviceId::new("a")), SessionState::Connecting);
        assert!(matches!(
            sessions.connect(&device("a")).await,
            Err(DmkError::ConnectInProgress(_))
        ));
        drop(pending);
        assert!(sessions.connect(&device("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_connect_can_be_retried() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        mock.fail_next_open(&DeviceId::new("a"));
        let sessions = manager(&mock);

        let err = sessions.connect(&device("a")).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(sessions.device_state(&DeviceId::new("a")), SessionState::Discovered);
        assert!(sessions.sessions().is_empty());

        assert!(sessions.connect(&device("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_vanished_device() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        mock.remove_device(&DeviceId::new("a"));
        let sessions = manager(&mock);

        assert!(matches!(
            sessions.connect(&device("a")).await,
            Err(DmkError::Connection {
                source: TransportError::DeviceNotFound(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_failure_still_unregisters() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        let sessions = manager(&mock);
        let session = sessions.connect(&device("a")).await.unwrap();

        mock.fail_close(&DeviceId::new("a"), true);
        assert!(matches!(
            sessions.disconnect(session.id()).await,
            Err(DmkError::Disconnection { .. })
        ));
        assert!(matches!(
            sessions.session(session.id()),
            Err(DmkError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_close_all() {
        let mock = MockTransport::new();
        mock.add_device(device("a"));
        mock.add_device(device("b"));
        let sessions = manager(&mock);
        let a = sessions.connect(&device("a")).await.unwrap();
        sessions.connect(&device("b")).await.unwrap();

        let entry = sessions.entry(a.id()).unwrap();
        let mut lifecycle = entry.subscribe_lifecycle();
        sessions.close_all().await.unwrap();

        assert!(sessions.sessions().is_empty());
        assert_eq!(*lifecycle.borrow_and_update(), SessionState::Closed);
        assert_eq!(mock.open_channels(&DeviceId::new("a")), 0);
        assert_eq!(mock.open_channels(&DeviceId::new("b")), 0);
    }
}
