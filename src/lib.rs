pub mod codec;
pub mod error;
pub mod frame;
pub mod machine;
pub mod model;
pub mod protocol;
pub mod session;

#[cfg(feature = "mqtt")]
pub mod config;

pub use error::{CommandError, DecodeError, EncodeError};
pub use frame::{BroadcastKind, FrameKind, RawFrame};
pub use model::{SensorReport, StatusReport, UnitState};
pub use protocol::Command;
pub use session::{Events, FrameSink, Session, DEFAULT_ADDR};
