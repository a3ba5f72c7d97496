//! Frame parsing, encoding, checksum, and classification.
//!
//! Wire format (byte offsets):
//! ```text
//! [0]=TX_ADDR [1]=RX_ADDR [2]=OPC1 [3]=LENGTH [4]=MODE [5]=OPC2 [6..]=PAYLOAD [last]=CHECKSUM
//! ```
//!
//! LENGTH counts everything between the length byte and the checksum, i.e.
//! `payload + 2`. CHECKSUM is the XOR of all preceding bytes.

use crate::codec::xor_checksum;
use crate::error::{DecodeError, EncodeError, Result};

/// Source address of every frame the indoor unit originates.
pub const ADDR_UNIT: u8 = 0x00;
/// Destination address of unsolicited state broadcasts.
pub const ADDR_BROADCAST: u8 = 0xFE;
/// Destination address of the periodic parameter frame.
pub const ADDR_PARAMS: u8 = 0x52;

const OPC1_STATE_FULL: u8 = 0x58;
const OPC1_STATE_COMPACT: u8 = 0x1C;
const OPC1_PARAMS: u8 = 0x11;
const OPC1_ACK: u8 = 0x18;
const OPC1_SENSOR: u8 = 0x1A;

/// Which of the two broadcast shapes a frame carries.
///
/// The compact form shares the full form's bit layout but stops short of the
/// room-temperature and save-mirror bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    /// `0x58`, 8 payload bytes.
    Full,
    /// `0x1C`, 6 payload bytes.
    Compact,
}

/// What a decoded frame means to a session at a given bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Unsolicited unit state broadcast.
    Broadcast(BroadcastKind),
    /// Periodic parameter frame (`0x00` -> `0x52`, opcode `0x11`).
    Params,
    /// Command acknowledgement addressed to us (`0x18/0x80/0xA1`).
    Ack,
    /// Sensor query reply addressed to us (`0x1A/0x80/0xEF`).
    SensorReply,
    /// Diagnostic query reply addressed to us (`0x18/0x80/0xE8`).
    ExtraReply,
    /// Anything else; silently ignored.
    Other,
}

/// A parsed frame with verified checksum and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tx_addr: u8,
    pub rx_addr: u8,
    pub opc1: u8,
    pub length: u8,
    pub mode_byte: u8,
    pub opc2: u8,
    /// Application data after OPC2, before the checksum.
    pub payload: Vec<u8>,
    pub checksum: u8,
}

impl RawFrame {
    /// Parse a single complete wire frame.
    pub fn parse(wire: &[u8]) -> Result<Self> {
        if wire.len() < 7 {
            return Err(DecodeError::TooShort { len: wire.len() });
        }
        let last = wire.len() - 1;
        let computed = xor_checksum(&wire[..last]);
        if computed != wire[last] {
            return Err(DecodeError::BadChecksum {
                expected: wire[last],
                computed,
            });
        }
        let length = wire[3];
        if usize::from(length) != wire.len() - 5 {
            return Err(DecodeError::LengthMismatch {
                length,
                wire_len: wire.len(),
            });
        }
        Ok(RawFrame {
            tx_addr: wire[0],
            rx_addr: wire[1],
            opc1: wire[2],
            length,
            mode_byte: wire[4],
            opc2: wire[5],
            payload: wire[6..last].to_vec(),
            checksum: wire[last],
        })
    }

    /// Classify this frame for a session listening at `addr`.
    ///
    /// Broadcast sub-kinds additionally require the payload to carry the
    /// bytes their bit layout reads; undersized state frames fall through to
    /// [`FrameKind::Other`].
    pub fn classify(&self, addr: u8) -> FrameKind {
        if self.tx_addr != ADDR_UNIT {
            return FrameKind::Other;
        }
        if self.rx_addr == ADDR_BROADCAST {
            return match self.opc1 {
                OPC1_STATE_FULL if self.payload.len() >= 8 => {
                    FrameKind::Broadcast(BroadcastKind::Full)
                }
                OPC1_STATE_COMPACT if self.payload.len() >= 6 => {
                    FrameKind::Broadcast(BroadcastKind::Compact)
                }
                _ => FrameKind::Other,
            };
        }
        if self.rx_addr == ADDR_PARAMS {
            return if self.opc1 == OPC1_PARAMS {
                FrameKind::Params
            } else {
                FrameKind::Other
            };
        }
        if self.rx_addr == addr && self.mode_byte == 0x80 {
            return match (self.opc1, self.opc2) {
                (OPC1_ACK, 0xA1) => FrameKind::Ack,
                (OPC1_SENSOR, 0xEF) => FrameKind::SensorReply,
                (OPC1_ACK, 0xE8) => FrameKind::ExtraReply,
                _ => FrameKind::Other,
            };
        }
        FrameKind::Other
    }
}

/// Encode a frame: `header || len(body) || body || xor`.
///
/// `body` is everything between the length byte and the checksum (the mode
/// byte, OPC2, and payload for frames that carry them).
pub fn encode(header: [u8; 3], body: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if body.len() >= 0xFF {
        return Err(EncodeError::PayloadTooLarge { len: body.len() });
    }
    let mut wire = Vec::with_capacity(body.len() + 5);
    wire.extend_from_slice(&header);
    wire.push(body.len() as u8);
    wire.extend_from_slice(body);
    wire.push(xor_checksum(&wire));
    Ok(wire)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
