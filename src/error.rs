use thiserror::Error;

/// Errors arising from parsing an inbound wire frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame or payload too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("checksum mismatch (expected 0x{expected:02X}, computed 0x{computed:02X})")]
    BadChecksum { expected: u8, computed: u8 },

    #[error("length byte {length} does not match a frame of {wire_len} bytes")]
    LengthMismatch { length: u8, wire_len: usize },
}

/// Errors arising from building an outbound wire frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload of {len} bytes does not fit the length byte")]
    PayloadTooLarge { len: usize },
}

/// Errors reported synchronously to the caller of a user-facing operation.
///
/// These never reach the bus: a rejected operation queues nothing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The short command is empty or not in the table for its kind.
    #[error("unknown {kind} command {cmd:?}")]
    InvalidCommand { kind: &'static str, cmd: String },

    /// A value is out of range or incompatible with the current unit state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No broadcast has been seen yet; the unit state is unknown.
    #[error("unit state not yet known (no broadcast seen)")]
    NotReady,
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;
