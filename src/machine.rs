//! Session state machine: states, deadlines, and retransmission bookkeeping.
//!
//! The machine is a tagged state value plus a deadline and a retry counter,
//! polled each tick against a caller-supplied monotonic instant. It holds the
//! last transmitted frame so a retry can resend the identical bytes; the
//! session decides when to transition and what to transmit.

use std::time::{Duration, Instant};

use crate::model::{self, Kind, UnitState};

/// Deadline for command, query, and toggle states.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(1);
/// Deadline for the post-ack confirmation wait.
pub const WSTAT_TIMEOUT: Duration = Duration::from_secs(2);
/// Transmissions of one frame before the machine gives up.
pub const MAX_ATTEMPTS: u8 = 5;

/// What a state-changing command expects the next broadcast to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Power(u8),
    Mode(u8),
    Fan(u8),
    Temp(i16),
}

impl Confirm {
    /// True once the model reflects the commanded value.
    ///
    /// An auto-mode command is confirmed by either auto pattern: the unit is
    /// free to report `auto heat` as `auto cool` and vice versa.
    pub fn satisfied(&self, unit: &UnitState) -> bool {
        match *self {
            Confirm::Power(bit) => unit.power == Some(bit),
            Confirm::Mode(bits) => match unit.mode {
                Some(seen) => seen == bits || (is_auto(bits) && is_auto(seen)),
                None => false,
            },
            Confirm::Fan(bits) => unit.fan_lv == Some(bits),
            Confirm::Temp(temp) => unit.temp1 == Some(temp),
        }
    }
}

fn is_auto(bits: u8) -> bool {
    model::bits_to_text(Kind::Mode, bits).starts_with("auto")
}

/// The session's position in its command/query/confirmation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Before the first broadcast; nothing may be dispatched.
    Start,
    /// Free to dispatch the next work item or poll.
    Idle,
    /// Command frame sent, awaiting the acknowledgement.
    Cmd { confirm: Confirm },
    /// Acknowledged; waiting for a broadcast to reflect the change.
    WStat { confirm: Confirm },
    /// Sensor query sent, awaiting its reply.
    Query1 { id: u8 },
    /// Diagnostic query sent, awaiting its reply.
    Query2 { id: u8 },
    /// Save-mode frame sent; confirmed by broadcast, not by ack.
    Ssave { target: u8 },
    /// Filter-reset frame sent; confirmed by the flag clearing.
    Filter,
    /// Pursuing a humidifier value that only a toggle can reach.
    Humid { target: u8, toggle: Vec<u8> },
    /// Humidifier toggle sent, awaiting the acknowledgement.
    HmdTgl { target: u8, toggle: Vec<u8> },
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Start => "start",
            State::Idle => "idle",
            State::Cmd { .. } => "cmd",
            State::WStat { .. } => "wstat",
            State::Query1 { .. } => "query1",
            State::Query2 { .. } => "query2",
            State::Ssave { .. } => "ssave",
            State::Filter => "filter",
            State::Humid { .. } => "humid",
            State::HmdTgl { .. } => "hmd_tgl",
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self {
            State::Start | State::Idle => None,
            State::WStat { .. } => Some(WSTAT_TIMEOUT),
            _ => Some(CMD_TIMEOUT),
        }
    }
}

/// Verdict of a timeout in a retry-counted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Early retry; retransmit without fuss.
    Silent,
    /// Late retry; retransmit and complain.
    Warn,
    /// Out of attempts; abandon the frame.
    GiveUp,
}

#[derive(Debug)]
pub struct Machine {
    state: State,
    deadline: Option<Instant>,
    attempts: u8,
    outstanding: Option<Vec<u8>>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            deadline: None,
            attempts: 0,
            outstanding: None,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn is_start(&self) -> bool {
        matches!(self.state, State::Start)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Enter `next`: arm its deadline and reset the retry counter.
    ///
    /// The outstanding packet is cleared on every exit except between Cmd and
    /// WStat, where it must survive so a confirmation timeout can resend the
    /// identical bytes.
    pub fn enter(&mut self, next: State, now: Instant) {
        let keep = matches!(
            (&self.state, &next),
            (State::Cmd { .. }, State::WStat { .. }) | (State::WStat { .. }, State::Cmd { .. })
        );
        if !keep {
            self.outstanding = None;
        }
        self.deadline = next.timeout().map(|t| now + t);
        self.attempts = 0;
        self.state = next;
    }

    /// Record a transmitted frame so retries can resend it byte-identically.
    pub fn arm(&mut self, frame: Vec<u8>) {
        self.outstanding = Some(frame);
    }

    pub fn outstanding(&self) -> Option<&[u8]> {
        self.outstanding.as_deref()
    }

    /// Reset the deadline for a self-loop retransmission.
    pub fn rearm_deadline(&mut self, now: Instant) {
        self.deadline = self.state.timeout().map(|t| now + t);
    }

    /// Whether the current state's deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Return to Start from any state, dropping the outstanding packet.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.deadline = None;
        self.attempts = 0;
        self.outstanding = None;
    }

    /// Count a timeout against the retry allowance.
    pub fn bump(&mut self) -> Retry {
        self.attempts += 1;
        if self.attempts >= MAX_ATTEMPTS {
            Retry::GiveUp
        } else if self.attempts < 2 {
            Retry::Silent
        } else {
            Retry::Warn
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BroadcastKind;

    #[test]
    fn retry_ladder() {
        let mut m = Machine::new();
        let verdicts: Vec<Retry> = (0..5).map(|_| m.bump()).collect();
        assert_eq!(
            verdicts,
            vec![
                Retry::Silent,
                Retry::Warn,
                Retry::Warn,
                Retry::Warn,
                Retry::GiveUp,
            ]
        );
    }

    #[test]
    fn enter_resets_retries() {
        let now = Instant::now();
        let mut m = Machine::new();
        m.enter(State::Query1 { id: 0x02 }, now);
        m.bump();
        m.bump();
        m.enter(State::Idle, now);
        m.enter(State::Query1 { id: 0x03 }, now);
        assert_eq!(m.bump(), Retry::Silent);
    }

    #[test]
    fn deadlines_per_state() {
        let now = Instant::now();
        let mut m = Machine::new();

        m.enter(State::Cmd { confirm: Confirm::Power(1) }, now);
        assert!(!m.expired(now + Duration::from_millis(900)));
        assert!(m.expired(now + Duration::from_millis(1100)));

        m.enter(State::WStat { confirm: Confirm::Power(1) }, now);
        assert!(!m.expired(now + Duration::from_millis(1500)));
        assert!(m.expired(now + Duration::from_millis(2100)));

        m.enter(State::Idle, now);
        assert!(!m.expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn rearm_pushes_deadline_out() {
        let now = Instant::now();
        let mut m = Machine::new();
        m.enter(State::Cmd { confirm: Confirm::Power(1) }, now);
        let later = now + Duration::from_millis(1100);
        assert!(m.expired(later));
        m.rearm_deadline(later);
        assert!(!m.expired(later + Duration::from_millis(900)));
    }

    #[test]
    fn outstanding_survives_cmd_wstat_round_trip() {
        let now = Instant::now();
        let mut m = Machine::new();
        let confirm = Confirm::Mode(0b010);
        m.enter(State::Cmd { confirm }, now);
        m.arm(vec![0x42, 0x00, 0x11]);

        m.enter(State::WStat { confirm }, now);
        assert!(m.outstanding().is_some());
        m.enter(State::Cmd { confirm }, now);
        assert_eq!(m.outstanding(), Some(&[0x42, 0x00, 0x11][..]));

        m.enter(State::Idle, now);
        assert!(m.outstanding().is_none());
    }

    #[test]
    fn outstanding_cleared_on_other_exits() {
        let now = Instant::now();
        let mut m = Machine::new();
        m.enter(State::Query1 { id: 0x02 }, now);
        m.arm(vec![0x01]);
        m.enter(State::Idle, now);
        assert!(m.outstanding().is_none());
    }

    fn unit_with(mode: u8, fan: u8, power: u8, temp: i16) -> UnitState {
        let mut unit = UnitState::new();
        let payload = [
            mode << 5 | power,
            fan << 5,
            0x00,
            0x00,
            crate::codec::temp_to_wire(temp),
            0x00,
            0x00,
            0x00,
        ];
        unit.apply_broadcast(BroadcastKind::Full, &payload);
        unit
    }

    #[test]
    fn confirm_reads_the_matching_field() {
        let unit = unit_with(0b010, 0b011, 1, 24);
        assert!(Confirm::Power(1).satisfied(&unit));
        assert!(!Confirm::Power(0).satisfied(&unit));
        assert!(Confirm::Mode(0b010).satisfied(&unit));
        assert!(Confirm::Fan(0b011).satisfied(&unit));
        assert!(Confirm::Temp(24).satisfied(&unit));
        assert!(!Confirm::Temp(25).satisfied(&unit));
    }

    #[test]
    fn confirm_mode_accepts_either_auto_pattern() {
        let reported_cool = unit_with(0b110, 0b010, 1, 24);
        assert!(Confirm::Mode(0b101).satisfied(&reported_cool));
        let reported_heat = unit_with(0b101, 0b010, 1, 24);
        assert!(Confirm::Mode(0b101).satisfied(&reported_heat));
        // Non-auto targets stay exact.
        assert!(!Confirm::Mode(0b001).satisfied(&reported_heat));
    }

    #[test]
    fn confirm_unknown_model_never_matches() {
        let unit = UnitState::new();
        assert!(!Confirm::Mode(0b101).satisfied(&unit));
        assert!(!Confirm::Power(1).satisfied(&unit));
    }
}
