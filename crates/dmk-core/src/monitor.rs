//! Device state monitoring.
//!
//! While at least one [`DeviceStateStream`] is open on a session, a refresh
//! task polls the device through the session queue and publishes what it
//! learns. Streams end by themselves when the session leaves `Connected`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::command::{BatteryReading, Command, GetAppAndVersion, GetBatteryStatus};
use crate::device::{AppInfo, BatteryStatus, DeviceState, DeviceStatus};
use crate::dispatcher::CommandDispatcher;
use crate::error::{DmkError, Result};
use crate::events::{DmkEvent, DmkObserver};
use crate::session::manager::SessionEntry;
use crate::session::{SessionId, SessionManager, SessionState};
use crate::sync::lock;

/// What one refresh learned. `None` fields are left as they were.
#[derive(Debug, Default)]
struct Observation {
    status: Option<DeviceStatus>,
    current_app: Option<Option<AppInfo>>,
    battery: Option<BatteryStatus>,
}

impl Observation {
    fn apply(self, state: &mut DeviceState) -> bool {
        let before = state.clone();
        if let Some(status) = self.status {
            // A caller command started meanwhile; its guard restores the status.
            let keep_busy = state.device_status == DeviceStatus::Busy && status == DeviceStatus::Connected;
            if !keep_busy {
                state.device_status = status;
            }
        }
        if let Some(app) = self.current_app {
            state.current_app = app;
        }
        if let Some(battery) = self.battery {
            state.battery_status = Some(battery);
        }
        *state != before
    }
}

/// Subscribes to device state and keeps it fresh.
pub struct StateMonitor {
    sessions: Arc<SessionManager>,
    dispatcher: Arc<CommandDispatcher>,
    poll_interval: Duration,
}

impl StateMonitor {
    pub fn new(sessions: Arc<SessionManager>, dispatcher: Arc<CommandDispatcher>, poll_interval: Duration) -> Self {
        Self {
            sessions,
            dispatcher,
            poll_interval,
        }
    }

    /// Observe a connected session. Must be called from within a tokio runtime.
    pub fn observe(&self, session_id: SessionId) -> Result<DeviceStateStream> {
        let entry = self.sessions.entry(session_id)?;
        let lifecycle = entry.subscribe_lifecycle();
        if !lifecycle.borrow().is_connected() {
            return Err(DmkError::UnknownSession(session_id));
        }

        let state = {
            let mut refresher = lock(&entry.refresher);
            let state = entry.device_state.subscribe();
            if !refresher.as_ref().is_some_and(|task| !task.is_finished()) {
                debug!(session = %session_id, interval_ms = self.poll_interval.as_millis() as u64, "Starting state refresh");
                *refresher = Some(tokio::spawn(refresh_loop(
                    Arc::clone(&self.dispatcher),
                    Arc::clone(self.sessions.observer()),
                    Arc::clone(&entry),
                    self.poll_interval,
                )));
            }
            state
        };
        Ok(DeviceStateStream::new(state, lifecycle))
    }

    /// Poll the device once and return the resulting state.
    pub async fn refresh(&self, session_id: SessionId) -> Result<DeviceState> {
        let entry = self.sessions.entry(session_id)?;
        refresh_once(&self.dispatcher, self.sessions.observer().as_ref(), &entry).await?;
        let state = entry.device_state.borrow().clone();
        Ok(state)
    }

    /// Last published state, without polling.
    pub fn current(&self, session_id: SessionId) -> Result<DeviceState> {
        Ok(self.sessions.entry(session_id)?.device_state.borrow().clone())
    }
}

async fn observe_device(dispatcher: &CommandDispatcher, entry: &SessionEntry) -> Result<Observation> {
    let session_id = entry.id();
    let mut seen = Observation::default();

    let response = dispatcher
        .exchange_quiet(session_id, &GetAppAndVersion.apdu()?)
        .await?;
    let sw = response.status_word();
    if sw.is_locked() {
        seen.status = Some(DeviceStatus::Locked);
        return Ok(seen);
    }
    if !sw.is_success() {
        trace!(session = %session_id, status = %sw, "Status kept");
        return Ok(seen);
    }
    let app = GetAppAndVersion.parse(&response)?;
    seen.status = Some(DeviceStatus::Connected);
    seen.current_app = Some(app.app_info());

    if entry.session().device().model_id.has_battery() {
        let battery = GetBatteryStatus::percentage();
        let response = dispatcher.exchange_quiet(session_id, &battery.apdu()?).await?;
        // Applications refuse dashboard commands; the last reading stays.
        if response.is_success()
            && let BatteryReading::Percentage(level) = battery.parse(&response)?
        {
            seen.battery = BatteryStatus::from_percentage(level);
        }
    }
    Ok(seen)
}

async fn refresh_once(dispatcher: &CommandDispatcher, observer: &dyn DmkObserver, entry: &SessionEntry) -> Result<()> {
    let seen = observe_device(dispatcher, entry).await?;
    let previous = entry.device_state.borrow().device_status.clone();
    if entry.device_state.send_if_modified(|state| seen.apply(state)) {
        let current = entry.device_state.borrow().device_status.clone();
        if current != previous {
            observer.on_event(&DmkEvent::StatusChanged {
                session_id: entry.id(),
                from: previous,
                to: current,
            });
        }
    }
    Ok(())
}

async fn refresh_loop(
    dispatcher: Arc<CommandDispatcher>,
    observer: Arc<dyn DmkObserver>,
    entry: Arc<SessionEntry>,
    every: Duration,
) {
    let mut lifecycle = entry.subscribe_lifecycle();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = lifecycle.changed() => {}
            _ = entry.device_state.closed() => {}
        }
        if !entry.state().is_connected() {
            break;
        }
        {
            let mut refresher = lock(&entry.refresher);
            // Checked under the lock so a concurrent observe either sees this
            // task still registered or starts a new one.
            if entry.device_state.receiver_count() == 0 {
                *refresher = None;
                debug!(session = %entry.id(), "State refresh stopped, no observers left");
                return;
            }
        }
        if let Err(e) = refresh_once(&dispatcher, observer.as_ref(), &entry).await {
            debug!(session = %entry.id(), error = %e, "State refresh failed");
        }
    }
    debug!(session = %entry.id(), "State refresh stopped, session closed");
}

/// A device state update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Status before this update; `None` for the first state of a stream.
    pub previous: Option<DeviceStatus>,
    pub state: DeviceState,
}

impl StateChange {
    /// The device just showed its PIN screen.
    pub fn became_locked(&self) -> bool {
        self.state.device_status.is_locked() && !self.previous.as_ref().is_some_and(DeviceStatus::is_locked)
    }

    pub fn status_changed(&self) -> bool {
        self.previous.as_ref() != Some(&self.state.device_status)
    }
}

/// Device state updates of one session.
///
/// Yields the current state first, then every change. Ends when the
/// session starts closing.
pub struct DeviceStateStream {
    state: watch::Receiver<DeviceState>,
    lifecycle: watch::Receiver<SessionState>,
    previous: Option<DeviceStatus>,
    primed: bool,
}

impl DeviceStateStream {
    fn new(state: watch::Receiver<DeviceState>, lifecycle: watch::Receiver<SessionState>) -> Self {
        Self {
            state,
            lifecycle,
            previous: None,
            primed: false,
        }
    }

    fn is_live(&self) -> bool {
        self.lifecycle.borrow().is_connected()
    }

    fn take(&mut self) -> StateChange {
        let state = self.state.borrow_and_update().clone();
        let previous = self.previous.replace(state.device_status.clone());
        StateChange { previous, state }
    }

    pub async fn next(&mut self) -> Option<StateChange> {
        if !self.primed {
            self.primed = true;
            if self.is_live() {
                return Some(self.take());
            }
        }
        loop {
            if !self.is_live() {
                return None;
            }
            tokio::select! {
                changed = self.state.changed() => {
                    if changed.is_err() || !self.is_live() {
                        return None;
                    }
                    return Some(self.take());
                }
                changed = self.lifecycle.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
