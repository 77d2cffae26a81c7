pub mod bus;
pub mod frame;
pub mod serial;

pub use bus::{Bus, BusError, BusOptions};
pub use frame::{Frame, FrameError};
pub use serial::{SerialSettings, SerialTransport, Transport, TransportError};
