//! DMK-Core: host-side core of a Ledger device management kit.
//!
//! Discover hardware signers over pluggable transports, open sessions on
//! them, exchange APDUs and follow the device state (lock, battery, running
//! application).
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: APDU codec, payload builder/parser, status words
//! - **Transport**: transport/channel contract (mock included)
//! - **Discovery**: live, deduplicated device snapshots
//! - **Session**: connect/disconnect state machine and session registry
//! - **Dispatcher**: per-session FIFO command queue
//! - **Command**: typed commands (app, OS, battery)
//! - **Monitor**: device state streams
//! - **Events**: Observer pattern for UI decoupling
//! - **Kit**: the context object tying it all together
//!
//! # Example
//!
//! ```no_run
//! use dmk_core::command::GetAppAndVersion;
//! use dmk_core::transport::MockTransport;
//! use dmk_core::DeviceManagementKit;
//!
//! # async fn run() -> dmk_core::Result<()> {
//! let dmk = DeviceManagementKit::builder()
//!     .add_transport(MockTransport::new())
//!     .build();
//!
//! if let Some(device) = dmk.available_devices().await.devices().first() {
//!     let session = dmk.connect(device).await?;
//!     let app = dmk.send_command(session.id(), &GetAppAndVersion).await?;
//!     println!("{} {}", app.name, app.version);
//!     dmk.disconnect(session.id()).await?;
//! }
//! dmk.close().await
//! # }
//! ```

pub mod command;
pub mod config;
pub mod device;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod kit;
pub mod monitor;
pub mod protocol;
pub mod session;
mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::DmkConfig;
pub use device::{
    AppInfo, BatteryStatus, DeviceDescriptor, DeviceId, DeviceModelId, DeviceState, DeviceStatus,
    TransportKind,
};
pub use discovery::{DeviceSnapshot, DiscoveryStream};
pub use error::{DmkError, Result};
pub use events::{CloseReason, DmkEvent, DmkObserver, NullObserver, TracingObserver};
pub use kit::{DeviceManagementKit, DeviceManagementKitBuilder};
pub use monitor::{DeviceStateStream, StateChange};
pub use protocol::{ApduCommand, ApduError, ApduResponse, StatusWord, is_success};
pub use session::{Session, SessionId, SessionState};
pub use transport::{Channel, MockTransport, Transport, TransportError};
