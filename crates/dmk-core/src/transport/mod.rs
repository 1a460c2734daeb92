//! Transport layer module.

pub mod mock;
pub mod observable;
pub mod traits;

pub use mock::{MockTransport, SimulatedDevice};
pub use observable::ObservableChannel;
pub use traits::{Channel, Transport, TransportError};
