pub mod event_system;
pub mod serial;
pub mod serial_protocol;
pub mod simulated;

pub use event_system::{TokioEventSystem, TopicEvent};
pub use serial::SerialConnection;
pub use serial_protocol::{FrameError, LineFramer};
pub use simulated::{SimulatedConnection, SimulatorHandle};
