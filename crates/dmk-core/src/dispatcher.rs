//! Command dispatch over established sessions.
//!
//! Every exchange on a session goes through the session's channel lock.
//! The lock is fair, so commands run one at a time in the order they were
//! issued; a command that was queued when the session started closing
//! fails with [`DmkError::UnknownSession`] instead of reaching the wire.
//!
//! Once a command holds the channel, its round trip runs on its own task:
//! a caller that stops waiting cannot leave a reply unread on the wire.
//! Any failure after the frame was written tears the session down; only a
//! failed write leaves it connected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, warn};

use crate::command::Command;
use crate::device::DeviceStatus;
use crate::error::{DmkError, Result};
use crate::events::CloseReason;
use crate::protocol::{ApduCommand, ApduResponse, is_success};
use crate::session::manager::SessionEntry;
use crate::session::{SessionId, SessionManager};
use crate::transport::{Channel, TransportError};

/// Where a round trip failed.
enum ExchangeFailure {
    /// Nothing reached the device; the channel is still in step.
    Write(TransportError),
    /// The frame was written but its reply was not read.
    Read(TransportError),
    Elapsed,
}

async fn round_trip(
    channel: &mut Box<dyn Channel>,
    frame: &[u8],
    limit: Duration,
) -> Result<Vec<u8>, ExchangeFailure> {
    let exchange = async {
        channel.write(frame).await.map_err(ExchangeFailure::Write)?;
        channel.read().await.map_err(ExchangeFailure::Read)
    };
    tokio::time::timeout(limit, exchange)
        .await
        .unwrap_or(Err(ExchangeFailure::Elapsed))
}

/// Shows `Busy` on a connected device while a caller command runs.
struct BusyGuard<'a> {
    entry: &'a SessionEntry,
    marked: bool,
}

impl<'a> BusyGuard<'a> {
    fn mark(entry: &'a SessionEntry) -> Self {
        let marked = entry.device_state.send_if_modified(|state| {
            if state.device_status == DeviceStatus::Connected {
                state.device_status = DeviceStatus::Busy;
                true
            } else {
                false
            }
        });
        Self { entry, marked }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if !self.marked {
            return;
        }
        self.entry.device_state.send_if_modified(|state| {
            if state.device_status == DeviceStatus::Busy {
                state.device_status = DeviceStatus::Connected;
                true
            } else {
                false
            }
        });
    }
}

/// Sends APDUs and structured commands through live sessions.
pub struct CommandDispatcher {
    sessions: Arc<SessionManager>,
    timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(sessions: Arc<SessionManager>, timeout: Duration) -> Self {
        Self { sessions, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a raw APDU and require `0x9000`.
    #[instrument(level = "debug", skip(self, command), fields(session = %session_id, ins = command.ins))]
    pub async fn send_apdu(&self, session_id: SessionId, command: &ApduCommand) -> Result<ApduResponse> {
        let response = self.exchange(session_id, command).await?;
        if !is_success(&response) {
            debug!(status = %response.status_word(), "Command refused");
            return Err(DmkError::UnexpectedStatus(response.status_word()));
        }
        Ok(response)
    }

    /// Send a structured command and parse its result.
    ///
    /// A response that does not parse is surfaced; the session stays up.
    pub async fn send_command<C: Command>(&self, session_id: SessionId, command: &C) -> Result<C::Output> {
        let apdu = command.apdu()?;
        debug!(session = %session_id, command = command.name(), "Sending command");
        let response = self.send_apdu(session_id, &apdu).await?;
        Ok(command.parse(&response)?)
    }

    /// Send a raw APDU and return whatever status the device answered.
    pub async fn exchange(&self, session_id: SessionId, command: &ApduCommand) -> Result<ApduResponse> {
        self.run(session_id, command, true).await
    }

    /// Like [`CommandDispatcher::exchange`], without the busy marker.
    pub(crate) async fn exchange_quiet(&self, session_id: SessionId, command: &ApduCommand) -> Result<ApduResponse> {
        self.run(session_id, command, false).await
    }

    async fn run(&self, session_id: SessionId, command: &ApduCommand, mark_busy: bool) -> Result<ApduResponse> {
        // Encoding errors never reach the queue.
        let frame = command.encode()?;
        let entry = self.sessions.entry(session_id)?;

        let channel = Arc::clone(&entry.channel).lock_owned().await;
        if !entry.state().is_connected() {
            return Err(DmkError::UnknownSession(session_id));
        }

        let task = tokio::spawn(Self::complete(
            Arc::clone(&self.sessions),
            entry,
            channel,
            frame,
            self.timeout,
            mark_busy,
        ));
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // The runtime is shutting down.
            Err(_) => Err(DmkError::UnknownSession(session_id)),
        }
    }

    /// Finish one round trip on a channel the command already holds.
    async fn complete(
        sessions: Arc<SessionManager>,
        entry: Arc<SessionEntry>,
        mut channel: OwnedMutexGuard<Box<dyn Channel>>,
        frame: Vec<u8>,
        limit: Duration,
        mark_busy: bool,
    ) -> Result<ApduResponse> {
        let session_id = entry.id();
        let _busy = mark_busy.then(|| BusyGuard::mark(&entry));

        match round_trip(&mut channel, &frame, limit).await {
            Ok(raw) => Ok(ApduResponse::decode(&raw)?),
            Err(ExchangeFailure::Write(TransportError::Disconnected)) => {
                warn!(session = %session_id, "Device lost before the command was sent");
                sessions
                    .drop_session(&entry, &mut channel, CloseReason::DeviceLost)
                    .await;
                Err(DmkError::Transport {
                    session_id,
                    source: TransportError::Disconnected,
                })
            }
            Err(ExchangeFailure::Write(source)) => {
                debug!(session = %session_id, error = %source, "Write failed, session kept");
                Err(DmkError::Transport { session_id, source })
            }
            Err(ExchangeFailure::Read(source)) => {
                let reason = match source {
                    TransportError::Timeout { .. } => CloseReason::Timeout,
                    _ => CloseReason::DeviceLost,
                };
                warn!(session = %session_id, error = %source, "Reply lost, closing session");
                sessions.drop_session(&entry, &mut channel, reason).await;
                Err(DmkError::Transport { session_id, source })
            }
            Err(ExchangeFailure::Elapsed) => {
                let timeout_ms = limit.as_millis() as u64;
                warn!(session = %session_id, timeout_ms, "Command timed out, closing session");
                sessions
                    .drop_session(&entry, &mut channel, CloseReason::Timeout)
                    .await;
                Err(DmkError::Timeout { session_id, timeout_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GetAppAndVersion;
    use crate::device::{DeviceDescriptor, DeviceId, DeviceModelId, TransportKind};
    use crate::discovery::DiscoveryService;
    use crate::events::NullObserver;
    use crate::protocol::StatusWord;
    use crate::session::{Session, SessionState};
    use crate::transport::MockTransport;

    const GET_VERSION: [u8; 5] = [0xE0, 0x01, 0x00, 0x00, 0x00];

    struct Fixture {
        mock: MockTransport,
        sessions: Arc<SessionManager>,
        dispatcher: CommandDispatcher,
        session: Session,
    }

    impl Fixture {
        fn device_id(&self) -> DeviceId {
            self.session.device().id.clone()
        }
    }

    async fn fixture(timeout: Duration) -> Fixture {
        let mock = MockTransport::new();
        let device = DeviceDescriptor::new("sim-1", "Nano X", TransportKind::Simulated, DeviceModelId::NanoX);
        mock.add_device(device.clone());
        let discovery = DiscoveryService::new(
            vec![Arc::new(mock.clone())],
            Arc::new(NullObserver),
            Duration::from_millis(10),
        );
        let sessions = Arc::new(SessionManager::new(Arc::new(discovery), Arc::new(NullObserver)));
        let session = sessions.connect(&device).await.unwrap();
        let dispatcher = CommandDispatcher::new(Arc::clone(&sessions), timeout);
        Fixture {
            mock,
            sessions,
            dispatcher,
            session,
        }
    }

    fn get_version() -> ApduCommand {
        ApduCommand::new(0xE0, 0x01, 0x00, 0x00)
    }

    #[tokio::test]
    async fn test_success_and_unexpected_status() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock.queue_status(&f.device_id(), 0x9000);
        f.mock.queue_status(&f.device_id(), 0x6A82);

        let ok = f.dispatcher.send_apdu(f.session.id(), &get_version()).await.unwrap();
        assert!(ok.data.is_empty());
        assert!(is_success(&ok));

        let err = f.dispatcher.send_apdu(f.session.id(), &get_version()).await.unwrap_err();
        assert!(matches!(err, DmkError::UnexpectedStatus(StatusWord::NotFound)));
        assert_eq!(err.status_code(), Some(0x6A82));

        assert_eq!(f.mock.writes(&f.device_id()), vec![GET_VERSION.to_vec(), GET_VERSION.to_vec()]);
    }

    #[tokio::test]
    async fn test_exchange_does_not_check_status() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock.queue_status(&f.device_id(), 0x5515);
        let response = f.dispatcher.exchange(f.session.id(), &get_version()).await.unwrap();
        assert_eq!(response.status_word(), StatusWord::DeviceLocked);
    }

    #[tokio::test]
    async fn test_commands_are_fifo() {
        let f = fixture(Duration::from_secs(1)).await;
        let id = f.device_id();
        f.mock.queue_delayed_reply(&id, Duration::from_millis(40), &[0x01, 0x90, 0x00]);
        f.mock.queue_reply(&id, &[0x02, 0x90, 0x00]);
        f.mock.queue_reply(&id, &[0x03, 0x90, 0x00]);

        let first = ApduCommand::new(0xE0, 0x01, 0x01, 0x00);
        let second = ApduCommand::new(0xE0, 0x01, 0x02, 0x00);
        let third = ApduCommand::new(0xE0, 0x01, 0x03, 0x00);
        let (a, b, c) = tokio::join!(
            f.dispatcher.send_apdu(f.session.id(), &first),
            f.dispatcher.send_apdu(f.session.id(), &second),
            f.dispatcher.send_apdu(f.session.id(), &third),
        );

        assert_eq!(a.unwrap().data, vec![0x01]);
        assert_eq!(b.unwrap().data, vec![0x02]);
        assert_eq!(c.unwrap().data, vec![0x03]);
        let p1s: Vec<u8> = f.mock.writes(&id).iter().map(|w| w[2]).collect();
        assert_eq!(p1s, vec![0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_send_command_parses() {
        let f = fixture(Duration::from_secs(1)).await;
        let app = f.dispatcher.send_command(f.session.id(), &GetAppAndVersion).await.unwrap();
        assert!(app.is_dashboard());
        assert_eq!(app.version, "2.2.3");
    }

    #[tokio::test]
    async fn test_decode_error_keeps_session() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock.queue_reply(&f.device_id(), &[0x90]);
        let err = f.dispatcher.exchange(f.session.id(), &get_version()).await.unwrap_err();
        assert!(matches!(err, DmkError::Apdu(ref e) if e.is_decoding()));
        assert_eq!(f.sessions.session_state(f.session.id()).unwrap(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_encoding_error_never_reaches_the_wire() {
        let f = fixture(Duration::from_secs(1)).await;
        let oversized = get_version().with_data(vec![0u8; 256]);
        let err = f.dispatcher.send_apdu(f.session.id(), &oversized).await.unwrap_err();
        assert!(matches!(err, DmkError::Apdu(ref e) if e.is_encoding()));
        assert!(f.mock.writes(&f.device_id()).is_empty());
    }

    #[tokio::test]
    async fn test_device_loss_closes_session() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock.queue_disconnect(&f.device_id());

        let err = f.dispatcher.send_apdu(f.session.id(), &get_version()).await.unwrap_err();
        assert!(matches!(
            err,
            DmkError::Transport {
                source: TransportError::Disconnected,
                ..
            }
        ));
        assert!(matches!(
            f.sessions.session(f.session.id()),
            Err(DmkError::UnknownSession(_))
        ));
        assert_eq!(f.mock.open_channels(&f.device_id()), 0);
    }

    #[tokio::test]
    async fn test_timeout_closes_session() {
        let f = fixture(Duration::from_millis(20)).await;
        f.mock
            .queue_delayed_reply(&f.device_id(), Duration::from_millis(500), &[0x90, 0x00]);

        let err = f.dispatcher.send_apdu(f.session.id(), &get_version()).await.unwrap_err();
        assert!(matches!(err, DmkError::Timeout { timeout_ms: 20, .. }));
        assert!(f.sessions.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_after_disconnect() {
        let f = fixture(Duration::from_secs(1)).await;
        f.sessions.disconnect(f.session.id()).await.unwrap();
        assert!(matches!(
            f.dispatcher.send_apdu(f.session.id(), &get_version()).await,
            Err(DmkError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_in_flight_command() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock
            .queue_delayed_reply(&f.device_id(), Duration::from_millis(30), &[0x90, 0x00]);

        let cmd = get_version();
        let (in_flight, closed, queued) = tokio::join!(
            f.dispatcher.send_apdu(f.session.id(), &cmd),
            f.sessions.disconnect(f.session.id()),
            f.dispatcher.send_apdu(f.session.id(), &cmd),
        );
        assert!(in_flight.is_ok());
        assert!(closed.is_ok());
        assert!(matches!(queued, Err(DmkError::UnknownSession(_))));
        assert_eq!(f.mock.writes(&f.device_id()).len(), 1);
    }

    #[tokio::test]
    async fn test_busy_marker() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock
            .queue_delayed_reply(&f.device_id(), Duration::from_millis(50), &[0x90, 0x00]);
        let entry = f.sessions.entry(f.session.id()).unwrap();
        let cmd = get_version();

        let (_, during) = tokio::join!(
            f.dispatcher.exchange(f.session.id(), &cmd),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                entry.device_state.borrow().device_status.clone()
            }
        );
        assert_eq!(during, DeviceStatus::Busy);
        assert_eq!(entry.device_state.borrow().device_status, DeviceStatus::Connected);
    }

    #[tokio::test]
    async fn test_abandoned_command_still_consumes_its_reply() {
        let f = fixture(Duration::from_secs(1)).await;
        let id = f.device_id();
        f.mock.queue_delayed_reply(&id, Duration::from_millis(50), &[0x01, 0x90, 0x00]);
        f.mock.queue_reply(&id, &[0x02, 0x90, 0x00]);

        let first = ApduCommand::new(0xE0, 0x01, 0x01, 0x00);
        let second = ApduCommand::new(0xE0, 0x01, 0x02, 0x00);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            f.dispatcher.send_apdu(f.session.id(), &first),
        )
        .await;
        assert!(abandoned.is_err());

        let reply = f.dispatcher.send_apdu(f.session.id(), &second).await.unwrap();
        assert_eq!(reply.data, vec![0x02]);
        assert_eq!(f.sessions.session_state(f.session.id()).unwrap(), SessionState::Connected);
        let p1s: Vec<u8> = f.mock.writes(&id).iter().map(|w| w[2]).collect();
        assert_eq!(p1s, vec![0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_read_failure_closes_session() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock.queue_read_error(&f.device_id(), "usb glitch");
        f.mock.queue_reply(&f.device_id(), &[0x01, 0x90, 0x00]);

        let err = f.dispatcher.send_apdu(f.session.id(), &get_version()).await.unwrap_err();
        assert!(matches!(
            err,
            DmkError::Transport {
                source: TransportError::ReadFailed(_),
                ..
            }
        ));
        assert!(matches!(
            f.sessions.session(f.session.id()),
            Err(DmkError::UnknownSession(_))
        ));
        assert_eq!(f.mock.open_channels(&f.device_id()), 0);
        assert!(matches!(
            f.dispatcher.send_apdu(f.session.id(), &get_version()).await,
            Err(DmkError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_write_failure_keeps_session() {
        let f = fixture(Duration::from_secs(1)).await;
        f.mock.fail_next_write(&f.device_id());
        f.mock.queue_reply(&f.device_id(), &[0x07, 0x90, 0x00]);

        let err = f.dispatcher.send_apdu(f.session.id(), &get_version()).await.unwrap_err();
        assert!(matches!(
            err,
            DmkError::Transport {
                source: TransportError::WriteFailed(_),
                ..
            }
        ));
        assert_eq!(f.sessions.session_state(f.session.id()).unwrap(), SessionState::Connected);

        let reply = f.dispatcher.send_apdu(f.session.id(), &get_version()).await.unwrap();
        assert_eq!(reply.data, vec![0x07]);
        assert_eq!(f.mock.writes(&f.device_id()).len(), 1);
    }
}
