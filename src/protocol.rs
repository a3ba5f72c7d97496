//! Command frame templates and addressed-reply payloads.
//!
//! - [`Command`] — frames this session sends to the unit
//! - [`SensorReply`] / [`ExtraReply`] — payloads the unit sends back
//!
//! Broadcast payloads are folded straight into the model
//! (see [`crate::model::UnitState::apply_broadcast`]).

use crate::codec::{read_int16, temp_to_wire, xor_checksum};
use crate::error::{DecodeError, Result};

/// Header nibbles selecting which field a `0x4C` command frame changes.
const HEAD_TMP: u8 = 0b01;
const HEAD_FAN: u8 = 0b10;

/// Reply status byte for an answered sensor query.
const SENSOR_OK: u8 = 0x2C;

/// Diagnostic query id for the instantaneous power indicators.
pub const EXTRA_POWER: u8 = 0x94;
/// Diagnostic query id for the accumulated filter hours.
pub const EXTRA_FILTER: u8 = 0x9E;

/// A frame this session can transmit, by user operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetPower { bit: u8 },
    SetMode { bits: u8 },
    SetTemp { mode: u8, fan: u8, temp: i16 },
    SetFan { mode: u8, fan: u8, temp: i16 },
    SetSave { save: u8, mode: u8, fan: u8, temp: i16 },
    ResetFilter,
    ToggleHumid,
    SensorQuery { id: u8 },
    ExtraQuery { id: u8 },
}

impl Command {
    /// Encode into complete wire bytes for a session at `addr`.
    pub fn encode(&self, addr: u8) -> Vec<u8> {
        let (header, body): ([u8; 3], Vec<u8>) = match *self {
            Command::SetPower { bit } => {
                ([addr, 0x00, 0x11], vec![0x08, 0x41, 0x02 | (bit & 0b1)])
            }
            Command::SetMode { bits } => ([addr, 0x00, 0x11], vec![0x08, 0x42, bits]),
            Command::SetTemp { mode, fan, temp } => (
                [addr, 0x00, 0x11],
                vec![
                    0x08,
                    0x4C,
                    HEAD_TMP << 3 | (mode & 0b111),
                    0b11_1000 | (fan & 0b111),
                    temp_to_wire(temp),
                ],
            ),
            Command::SetFan { mode, fan, temp } => (
                [addr, 0x00, 0x11],
                vec![
                    0x08,
                    0x4C,
                    HEAD_FAN << 3 | (mode & 0b111),
                    0b11_1000 | (fan & 0b111),
                    temp_to_wire(temp),
                ],
            ),
            Command::SetSave { save, mode, fan, temp } => (
                [addr, 0xFE, 0x10],
                vec![
                    0x00,
                    0x4C,
                    0b10_0000 | (mode & 0b111),
                    save << 4 | 0b1000 | (fan & 0b111),
                    temp_to_wire(temp),
                ],
            ),
            Command::ResetFilter => ([addr, 0xFE, 0x10], vec![0x00, 0x4B]),
            Command::ToggleHumid => ([addr, 0x00, 0x11], vec![0x08, 0x52, 0x01]),
            Command::SensorQuery { id } => (
                [addr, 0x00, 0x17],
                vec![0x08, 0x80, 0xEF, 0x00, SENSOR_OK, 0x08, 0x00, id],
            ),
            Command::ExtraQuery { id } => {
                ([addr, 0x00, 0x15], vec![0x08, 0xE8, 0x00, 0x01, 0x00, id])
            }
        };

        // Command bodies are all small enough for the length byte.
        let mut wire = Vec::with_capacity(body.len() + 5);
        wire.extend_from_slice(&header);
        wire.push(body.len() as u8);
        wire.extend_from_slice(&body);
        wire.push(xor_checksum(&wire));
        wire
    }
}

/// Decoded sensor query reply (`0x1A/0x80/0xEF`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReply {
    /// `None` when the unit refused the query.
    pub reading: Option<i16>,
}

impl SensorReply {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let status = *payload
            .get(2)
            .ok_or(DecodeError::TooShort { len: payload.len() })?;
        if status != SENSOR_OK {
            return Ok(Self { reading: None });
        }
        let value = read_int16(payload, 3).ok_or(DecodeError::TooShort { len: payload.len() })?;
        Ok(Self {
            reading: Some(value),
        })
    }
}

/// Decoded diagnostic query reply (`0x18/0x80/0xE8`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraReply {
    /// First five payload bytes, kept raw for diagnostics.
    pub raw: Vec<u8>,
}

impl ExtraReply {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(DecodeError::TooShort { len: payload.len() });
        }
        Ok(Self {
            raw: payload[..5].to_vec(),
        })
    }

    /// Split a power-levels reply (`0x94`) into its two indicator bytes.
    pub fn power_levels(&self) -> (u8, u8) {
        (self.raw[3], self.raw[4])
    }

    /// Assemble a filter-hours reply (`0x9E`) into a 16-bit hour count.
    pub fn filter_hours(&self) -> u16 {
        u16::from(self.raw[3]) << 8 | u16::from(self.raw[4])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;

    const ADDR: u8 = 0x42;

    #[test]
    fn set_temp_worked_example() {
        // 24 degC in heat mode with auto fan, from a live capture.
        let wire = Command::SetTemp {
            mode: 0b001,
            fan: 0b010,
            temp: 24,
        }
        .encode(ADDR);
        assert_eq!(
            wire,
            vec![0x42, 0x00, 0x11, 0x05, 0x08, 0x4C, 0x09, 0x3A, 0x76, 0x21]
        );
    }

    #[test]
    fn set_power_frames() {
        let on = Command::SetPower { bit: 1 }.encode(ADDR);
        assert_eq!(&on[..7], &[0x42, 0x00, 0x11, 0x03, 0x08, 0x41, 0x03]);
        let off = Command::SetPower { bit: 0 }.encode(ADDR);
        assert_eq!(&off[..7], &[0x42, 0x00, 0x11, 0x03, 0x08, 0x41, 0x02]);
    }

    #[test]
    fn set_mode_frame() {
        let wire = Command::SetMode { bits: 0b010 }.encode(ADDR);
        assert_eq!(wire, vec![0x42, 0x00, 0x11, 0x03, 0x08, 0x42, 0x02, 0x18]);
    }

    #[test]
    fn set_fan_uses_fan_head() {
        let wire = Command::SetFan {
            mode: 0b001,
            fan: 0b101,
            temp: 22,
        }
        .encode(ADDR);
        // 0b10 << 3 | mode
        assert_eq!(wire[6], 0b10_001);
        assert_eq!(wire[7], 0b11_1101);
        assert_eq!(wire[8], 0x72);
    }

    #[test]
    fn set_save_targets_broadcast_address() {
        let wire = Command::SetSave {
            save: 0b00,
            mode: 0b001,
            fan: 0b010,
            temp: 22,
        }
        .encode(ADDR);
        assert_eq!(&wire[..4], &[0x42, 0xFE, 0x10, 0x05]);
        assert_eq!(wire[4], 0x00);
        assert_eq!(wire[5], 0x4C);
        assert_eq!(wire[6], 0b10_0001);
        assert_eq!(wire[7], 0b0000_1010); // save<<4 | 0b1000 | fan
        assert_eq!(wire[8], 0x72);
    }

    #[test]
    fn reset_filter_frame() {
        let wire = Command::ResetFilter.encode(ADDR);
        assert_eq!(&wire[..6], &[0x42, 0xFE, 0x10, 0x02, 0x00, 0x4B]);
    }

    #[test]
    fn toggle_humid_frame() {
        let wire = Command::ToggleHumid.encode(ADDR);
        assert_eq!(&wire[..7], &[0x42, 0x00, 0x11, 0x03, 0x08, 0x52, 0x01]);
    }

    #[test]
    fn sensor_query_frame() {
        let wire = Command::SensorQuery { id: 0x02 }.encode(ADDR);
        assert_eq!(
            &wire[..12],
            &[0x42, 0x00, 0x17, 0x08, 0x08, 0x80, 0xEF, 0x00, 0x2C, 0x08, 0x00, 0x02]
        );
        // Query id rides at wire offset 11.
        assert_eq!(wire[11], 0x02);
    }

    #[test]
    fn extra_query_frame() {
        let wire = Command::ExtraQuery { id: EXTRA_POWER }.encode(ADDR);
        assert_eq!(
            &wire[..10],
            &[0x42, 0x00, 0x15, 0x06, 0x08, 0xE8, 0x00, 0x01, 0x00, 0x94]
        );
    }

    #[test]
    fn every_command_satisfies_the_frame_invariants() {
        let commands = [
            Command::SetPower { bit: 1 },
            Command::SetMode { bits: 0b001 },
            Command::SetTemp { mode: 0b001, fan: 0b010, temp: 24 },
            Command::SetFan { mode: 0b010, fan: 0b011, temp: 20 },
            Command::SetSave { save: 0b11, mode: 0b001, fan: 0b100, temp: 25 },
            Command::ResetFilter,
            Command::ToggleHumid,
            Command::SensorQuery { id: 0x60 },
            Command::ExtraQuery { id: EXTRA_FILTER },
        ];
        for cmd in commands {
            let wire = cmd.encode(ADDR);
            let frame = RawFrame::parse(&wire).unwrap();
            assert_eq!(frame.tx_addr, ADDR, "{cmd:?}");
            assert_eq!(usize::from(frame.length), wire.len() - 5, "{cmd:?}");
        }
    }

    #[test]
    fn sensor_reply_with_reading() {
        let reply = SensorReply::decode(&[0x00, 0x00, 0x2C, 0x00, 0x1A]).unwrap();
        assert_eq!(reply.reading, Some(26));
    }

    #[test]
    fn sensor_reply_negative_reading() {
        let reply = SensorReply::decode(&[0x00, 0x00, 0x2C, 0xFF, 0xF6]).unwrap();
        assert_eq!(reply.reading, Some(-10));
    }

    #[test]
    fn sensor_reply_refused() {
        let reply = SensorReply::decode(&[0x00, 0x00, 0x00, 0x00, 0x1A]).unwrap();
        assert_eq!(reply.reading, None);
    }

    #[test]
    fn sensor_reply_too_short() {
        assert!(SensorReply::decode(&[0x00, 0x00]).is_err());
        assert!(SensorReply::decode(&[0x00, 0x00, 0x2C, 0x00]).is_err());
    }

    #[test]
    fn extra_reply_power_split() {
        let reply = ExtraReply::decode(&[0x00, 0x01, 0x94, 0x05, 0x0A]).unwrap();
        assert_eq!(reply.power_levels(), (0x05, 0x0A));
        assert_eq!(reply.raw.len(), 5);
    }

    #[test]
    fn extra_reply_filter_hours() {
        let reply = ExtraReply::decode(&[0x00, 0x01, 0x9E, 0x04, 0xB0]).unwrap();
        assert_eq!(reply.filter_hours(), 1200);
    }

    #[test]
    fn extra_reply_too_short() {
        assert!(ExtraReply::decode(&[0x00, 0x01, 0x94, 0x05]).is_err());
    }
}
