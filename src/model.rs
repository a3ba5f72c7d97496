//! Decoded unit state and the symbolic <-> bit-pattern tables.
//!
//! The model is only ever mutated by frame parsing; user-facing operations
//! read it to fill in the fields a command template needs.

use std::collections::HashMap;

use crate::codec::temp_from_wire;
use crate::error::CommandError;
use crate::frame::BroadcastKind;

/// Lowest accepted setpoint in degrees Celsius.
pub const MIN_TMP: i16 = 18;
/// Highest accepted setpoint in degrees Celsius.
pub const MAX_TMP: i16 = 29;

/// Table rows: (wire bits, short command, label).
type Row = (u8, &'static str, &'static str);

const POWER: &[Row] = &[(0b1, "1", "on"), (0b0, "0", "off")];

const MODE: &[Row] = &[
    (0b001, "H", "heat"),
    (0b010, "C", "cool"),
    (0b011, "F", "fan"),
    (0b100, "D", "dry"),
    (0b101, "A", "auto heat"),
    // Auto-cool is reported by the unit but cannot be commanded directly.
    (0b110, "", "auto cool"),
];

const FAN: &[Row] = &[
    (0b101, "L", "low"),
    (0b100, "M", "mid"),
    (0b011, "H", "high"),
    (0b010, "A", "auto"),
];

const SAVE: &[Row] = &[(0b11, "R", "off"), (0b00, "S", "on")];

const HUMID: &[Row] = &[(0b1, "1", "on"), (0b0, "0", "off")];

/// Which symbol table a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Power,
    Mode,
    Fan,
    Save,
    Humid,
}

impl Kind {
    fn table(self) -> &'static [Row] {
        match self {
            Kind::Power => POWER,
            Kind::Mode => MODE,
            Kind::Fan => FAN,
            Kind::Save => SAVE,
            Kind::Humid => HUMID,
        }
    }

    fn bit_width(self) -> usize {
        match self {
            Kind::Power | Kind::Humid => 1,
            Kind::Save => 2,
            Kind::Mode | Kind::Fan => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Power => "power",
            Kind::Mode => "mode",
            Kind::Fan => "fan",
            Kind::Save => "save",
            Kind::Humid => "humid",
        }
    }
}

/// Translate wire bits into the canonical label, or a binary rendering for
/// values outside the table.
pub fn bits_to_text(kind: Kind, bits: u8) -> String {
    for &(value, _, label) in kind.table() {
        if value == bits {
            return label.to_string();
        }
    }
    format!("{bits:0width$b}", width = kind.bit_width())
}

/// Translate a short command into its wire bits.
///
/// Empty input is rejected outright: the auto-cool row carries an empty
/// command string precisely so it can never be selected.
pub fn cmd_to_bits(kind: Kind, cmd: &str) -> Result<u8, CommandError> {
    if !cmd.is_empty() {
        for &(value, short, _) in kind.table() {
            if short == cmd {
                return Ok(value);
            }
        }
    }
    Err(CommandError::InvalidCommand {
        kind: kind.name(),
        cmd: cmd.to_string(),
    })
}

/// The latest decoded state of the indoor unit.
///
/// Fields decoded from broadcasts are `None` until the first broadcast of a
/// shape that carries them arrives.
#[derive(Debug, Clone, Default)]
pub struct UnitState {
    /// Compressor power bit.
    pub power: Option<u8>,
    /// Operating mode bits (see [`Kind::Mode`]).
    pub mode: Option<u8>,
    /// Fan speed bits (see [`Kind::Fan`]).
    pub fan_lv: Option<u8>,
    /// Energy-save mode bits.
    pub save: Option<u8>,
    /// Save mirror flag from the full broadcast's last byte.
    pub save1: Option<u8>,
    /// Self-cleaning flag.
    pub clean: Option<u8>,
    /// Filter warning flag.
    pub filter: Option<u8>,
    /// Ventilation flag.
    pub vent: Option<u8>,
    /// Humidifier flag.
    pub humid: Option<u8>,
    /// Setpoint in degrees Celsius.
    pub temp1: Option<i16>,
    /// Measured room temperature (full broadcasts only).
    pub temp2: Option<i16>,
    /// Instantaneous power indicators from diagnostic query `0x94`.
    pub pwr_lv1: u8,
    pub pwr_lv2: u8,
    /// Accumulated filter-use hours from diagnostic query `0x9E`.
    pub filter_time: u16,
    /// Sensor readings by query id; `None` when the unit refused the query.
    pub sensor: HashMap<u8, Option<i16>>,
    /// Raw diagnostic reply payloads by query id.
    pub extra: HashMap<u8, Vec<u8>>,
    /// Last raw full-broadcast payload.
    pub state1: Option<Vec<u8>>,
    /// Last raw compact-broadcast payload.
    pub state2: Option<Vec<u8>>,
    /// Last raw parameter-frame bytes.
    pub params: Option<Vec<u8>>,
}

impl UnitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a broadcast payload into the model.
    ///
    /// Both shapes share the first six bytes; only the full form carries the
    /// room temperature and the save mirror flag, so a compact broadcast
    /// leaves those fields untouched.
    pub fn apply_broadcast(&mut self, kind: BroadcastKind, payload: &[u8]) {
        match kind {
            BroadcastKind::Full => {
                self.state1 = Some(payload.to_vec());
                self.temp2 = Some(temp_from_wire(payload[5]));
                self.save1 = Some(payload[7] & 0b1);
            }
            BroadcastKind::Compact => {
                self.state2 = Some(payload.to_vec());
            }
        }
        self.power = Some(payload[0] & 0b1);
        self.mode = Some((payload[0] >> 5) & 0b111);
        self.save = Some((payload[0] >> 3) & 0b11);
        self.clean = Some((payload[1] >> 2) & 0b1);
        self.fan_lv = Some((payload[1] >> 5) & 0b111);
        self.filter = Some((payload[2] >> 7) & 0b1);
        self.vent = Some((payload[2] >> 2) & 0b1); // this might be incorrect
        self.humid = Some((payload[2] >> 1) & 0b1);
        self.temp1 = Some(temp_from_wire(payload[4]));
    }

    /// User-visible status snapshot, one field per `status` topic key.
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            power: self.power.map(|b| bits_to_text(Kind::Power, b)),
            mode: self.mode.map(|b| bits_to_text(Kind::Mode, b)),
            clean: self.clean.map(flag_text),
            fanlv: self.fan_lv.map(|b| bits_to_text(Kind::Fan, b)),
            settmp: self.temp1,
            temp: self.temp2,
            filter: self.filter.map(flag_text),
            vent: self.vent.map(flag_text),
            save: self.save.map(|b| bits_to_text(Kind::Save, b)),
            humid: self.humid.map(|b| bits_to_text(Kind::Humid, b)),
        }
    }

    /// Sensor and diagnostics snapshot, one field per `update` topic key.
    pub fn sensor_report(&self) -> SensorReport {
        SensorReport {
            pwrlv1: self.pwr_lv1,
            pwrlv2: self.pwr_lv2,
            filter_time: self.filter_time,
            sens_ta: self.reading(0x02),
            sens_tcj: self.reading(0x03),
            sens_tc: self.reading(0x04),
            sens_te: self.reading(0x60),
            sens_to: self.reading(0x61),
            sens_td: self.reading(0x62),
            sens_ts: self.reading(0x63),
            sens_ths: self.reading(0x65),
            sens_current: self.reading(0x6A),
        }
    }

    fn reading(&self, id: u8) -> Option<i16> {
        self.sensor.get(&id).copied().flatten()
    }
}

fn flag_text(bit: u8) -> String {
    if bit == 1 { "on" } else { "off" }.to_string()
}

/// Snapshot published on the `status` topic after every broadcast.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StatusReport {
    pub power: Option<String>,
    pub mode: Option<String>,
    pub clean: Option<String>,
    pub fanlv: Option<String>,
    pub settmp: Option<i16>,
    pub temp: Option<i16>,
    pub filter: Option<String>,
    pub vent: Option<String>,
    pub save: Option<String>,
    pub humid: Option<String>,
}

/// Snapshot published on the `update` topic after each poll cycle.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SensorReport {
    pub pwrlv1: u8,
    pub pwrlv2: u8,
    pub filter_time: u16,
    pub sens_ta: Option<i16>,
    pub sens_tcj: Option<i16>,
    pub sens_tc: Option<i16>,
    pub sens_te: Option<i16>,
    pub sens_to: Option<i16>,
    pub sens_td: Option<i16>,
    pub sens_ts: Option<i16>,
    pub sens_ths: Option<i16>,
    pub sens_current: Option<i16>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_round_trip() {
        for kind in [Kind::Power, Kind::Mode, Kind::Fan, Kind::Save, Kind::Humid] {
            for &(bits, cmd, label) in kind.table() {
                if cmd.is_empty() {
                    continue;
                }
                assert_eq!(cmd_to_bits(kind, cmd).unwrap(), bits);
                assert_eq!(bits_to_text(kind, bits), label);
            }
        }
    }

    #[test]
    fn bits_to_text_fallback_is_binary() {
        assert_eq!(bits_to_text(Kind::Mode, 0b111), "111");
        assert_eq!(bits_to_text(Kind::Save, 0b01), "01");
        assert_eq!(bits_to_text(Kind::Fan, 0b000), "000");
    }

    #[test]
    fn cmd_to_bits_rejects_empty_and_unknown() {
        assert!(matches!(
            cmd_to_bits(Kind::Mode, ""),
            Err(CommandError::InvalidCommand { kind: "mode", .. })
        ));
        assert!(matches!(
            cmd_to_bits(Kind::Fan, "X"),
            Err(CommandError::InvalidCommand { kind: "fan", .. })
        ));
    }

    /// Payload for a full broadcast: power on, auto-heat, save on, fan low,
    /// filter flag set, setpoint 28, room 27.
    fn full_payload() -> [u8; 8] {
        [
            0b101_00_00_1, // mode=101 save=00 power=1
            0b101_0_0_000, // fan=101 clean=0
            0b1_0000_0_0_0, // filter=1 vent=0 humid=0
            0x00,
            0x7E, // (28+35)*2
            0x7C, // (27+35)*2
            0x00,
            0x01, // save1 mirror
        ]
    }

    #[test]
    fn full_broadcast_decodes_every_field() {
        let mut unit = UnitState::new();
        unit.apply_broadcast(BroadcastKind::Full, &full_payload());
        assert_eq!(unit.power, Some(1));
        assert_eq!(unit.mode, Some(0b101));
        assert_eq!(unit.save, Some(0b00));
        assert_eq!(unit.fan_lv, Some(0b101));
        assert_eq!(unit.clean, Some(0));
        assert_eq!(unit.filter, Some(1));
        assert_eq!(unit.vent, Some(0));
        assert_eq!(unit.humid, Some(0));
        assert_eq!(unit.temp1, Some(28));
        assert_eq!(unit.temp2, Some(27));
        assert_eq!(unit.save1, Some(1));
        assert_eq!(unit.state1.as_deref(), Some(&full_payload()[..]));
    }

    #[test]
    fn compact_broadcast_keeps_full_only_fields() {
        let mut unit = UnitState::new();
        unit.apply_broadcast(BroadcastKind::Full, &full_payload());

        // Compact frame showing cool mode at 22 degC; temp2/save1 must survive.
        let compact = [0b010_11_00_0, 0b010_00000, 0x00, 0x00, 0x72, 0x00];
        unit.apply_broadcast(BroadcastKind::Compact, &compact);
        assert_eq!(unit.power, Some(0));
        assert_eq!(unit.mode, Some(0b010));
        assert_eq!(unit.save, Some(0b11));
        assert_eq!(unit.fan_lv, Some(0b010));
        assert_eq!(unit.temp1, Some(22));
        assert_eq!(unit.temp2, Some(27));
        assert_eq!(unit.save1, Some(1));
        assert_eq!(unit.state2.as_deref(), Some(&compact[..]));
    }

    #[test]
    fn status_report_translates_symbols() {
        let mut unit = UnitState::new();
        unit.apply_broadcast(BroadcastKind::Full, &full_payload());
        let report = unit.status_report();
        assert_eq!(report.power.as_deref(), Some("on"));
        assert_eq!(report.mode.as_deref(), Some("auto heat"));
        assert_eq!(report.fanlv.as_deref(), Some("low"));
        assert_eq!(report.save.as_deref(), Some("on"));
        assert_eq!(report.filter.as_deref(), Some("on"));
        assert_eq!(report.humid.as_deref(), Some("off"));
        assert_eq!(report.settmp, Some(28));
        assert_eq!(report.temp, Some(27));
    }

    #[test]
    fn status_report_before_first_broadcast_is_empty() {
        let report = UnitState::new().status_report();
        assert_eq!(report.power, None);
        assert_eq!(report.settmp, None);
    }

    #[test]
    fn sensor_report_distinguishes_refused_and_missing() {
        let mut unit = UnitState::new();
        unit.sensor.insert(0x02, Some(26));
        unit.sensor.insert(0x65, None); // unit refused
        unit.pwr_lv1 = 0x05;
        unit.filter_time = 1200;
        let report = unit.sensor_report();
        assert_eq!(report.sens_ta, Some(26));
        assert_eq!(report.sens_ths, None);
        assert_eq!(report.sens_current, None); // never queried
        assert_eq!(report.pwrlv1, 0x05);
        assert_eq!(report.filter_time, 1200);
    }
}
