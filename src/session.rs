//! Session and scheduler: the single owner of the device model and the state
//! machine.
//!
//! The session is driven from a cooperative main loop: the transport feeds
//! inbound frames through [`Session::on_frame`], and the loop calls
//! [`Session::tick`] to flush the waiting outbound packet, check deadlines,
//! and dispatch queued work. Nothing here blocks; waiting is expressed as
//! machine deadlines polled against the instant the caller passes in.
//!
//! The outbound sink is only ever written from `tick`, never from inside a
//! frame handler or a user operation, so transport callbacks may call
//! `on_frame` from their own thread as long as the owner serialises access to
//! the session itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::error::CommandError;
use crate::frame::{BroadcastKind, FrameKind, RawFrame};
use crate::machine::{Confirm, Machine, Retry, State};
use crate::model::{self, Kind, UnitState, MAX_TMP, MIN_TMP};
use crate::protocol::{Command, ExtraReply, SensorReply, EXTRA_FILTER, EXTRA_POWER};

/// Bus address this session answers to unless told otherwise.
pub const DEFAULT_ADDR: u8 = 0x42;

/// Interval between periodic sensor/diagnostic poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Sensor query ids issued by each poll cycle.
const POLL_SENSORS: [u8; 9] = [0x02, 0x03, 0x04, 0x60, 0x61, 0x62, 0x63, 0x65, 0x6A];

/// Outbound byte-frame sink: hand off one complete wire frame.
pub trait FrameSink {
    fn transmit(&mut self, frame: &[u8]);
}

/// Event sinks for session lifecycle and model updates.
///
/// All methods default to no-ops so implementors wire up only what they
/// publish.
pub trait Events {
    /// The machine (re-)entered Start.
    fn on_start(&mut self) {}
    /// The first broadcast arrived; the session is operational.
    fn on_ready(&mut self) {}
    /// The machine changed state.
    fn on_state_change(&mut self, _name: &'static str) {}
    /// A broadcast updated the model.
    fn on_status(&mut self, _unit: &UnitState, _kind: BroadcastKind) {}
    /// A poll cycle completed.
    fn on_update(&mut self, _unit: &UnitState) {}
}

struct NoEvents;

impl Events for NoEvents {}

/// A queued unit of bus work, dispatched one per Idle visit.
#[derive(Debug)]
enum Work {
    /// State-changing command: awaits ack, then broadcast confirmation.
    Command { frame: Vec<u8>, confirm: Confirm },
    /// Save-mode frame: no ack; confirmed by broadcast alone.
    Save { frame: Vec<u8>, target: u8 },
    /// Filter reset: confirmed by the filter flag clearing.
    Filter { frame: Vec<u8> },
    /// Sensor query: awaits its addressed reply.
    Sensor { frame: Vec<u8>, id: u8 },
    /// Diagnostic query: awaits its addressed reply.
    Extra { frame: Vec<u8>, id: u8 },
    /// Humidifier pursuit: toggles until the model shows `target`.
    Humid { toggle: Vec<u8>, target: u8 },
}

/// A protocol session against one indoor unit.
pub struct Session {
    addr: u8,
    unit: UnitState,
    machine: Machine,
    queue: VecDeque<Work>,
    /// Single-slot outbound buffer; flushed to the sink at the next tick.
    waiting: Option<Vec<u8>>,
    sink: Option<Box<dyn FrameSink>>,
    events: Box<dyn Events>,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    update_pending: bool,
}

impl Session {
    pub fn new(addr: u8) -> Self {
        Self {
            addr,
            unit: UnitState::new(),
            machine: Machine::new(),
            queue: VecDeque::new(),
            waiting: None,
            sink: None,
            events: Box::new(NoEvents),
            poll_interval: POLL_INTERVAL,
            last_poll: None,
            update_pending: false,
        }
    }

    /// Attach the outbound sink. A session without one is listen-only: it
    /// models the bus but queues nothing.
    pub fn set_sink(&mut self, sink: impl FrameSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Attach the event sinks.
    pub fn set_events(&mut self, events: impl Events + 'static) {
        self.events = Box::new(events);
    }

    /// Override the periodic poll interval (mainly for tests and tooling).
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// The latest decoded unit state.
    pub fn unit(&self) -> &UnitState {
        &self.unit
    }

    /// Name of the machine's current state.
    pub fn state_name(&self) -> &'static str {
        self.machine.state_name()
    }

    // -----------------------------------------------------------------------
    // User-facing operations
    // -----------------------------------------------------------------------

    /// Switch the compressor on (`"1"`) or off (`"0"`).
    pub fn set_power(&mut self, cmd: &str) -> Result<(), CommandError> {
        self.ensure_ready()?;
        let bit = model::cmd_to_bits(Kind::Power, cmd)?;
        let frame = Command::SetPower { bit }.encode(self.addr);
        self.push(Work::Command {
            frame,
            confirm: Confirm::Power(bit),
        });
        Ok(())
    }

    /// Select an operating mode by its short command (`"H"`, `"C"`, ...).
    pub fn set_mode(&mut self, cmd: &str) -> Result<(), CommandError> {
        self.ensure_ready()?;
        let bits = model::cmd_to_bits(Kind::Mode, cmd)?;
        let frame = Command::SetMode { bits }.encode(self.addr);
        self.push(Work::Command {
            frame,
            confirm: Confirm::Mode(bits),
        });
        Ok(())
    }

    /// Select a fan level by its short command (`"L"`, `"M"`, `"H"`, `"A"`).
    pub fn set_fan(&mut self, cmd: &str) -> Result<(), CommandError> {
        self.ensure_ready()?;
        let fan = model::cmd_to_bits(Kind::Fan, cmd)?;
        let mode = self.unit.mode.ok_or(CommandError::NotReady)?;
        let temp = self.unit.temp1.ok_or(CommandError::NotReady)?;
        let frame = Command::SetFan { mode, fan, temp }.encode(self.addr);
        self.push(Work::Command {
            frame,
            confirm: Confirm::Fan(fan),
        });
        Ok(())
    }

    /// Change the setpoint. Rejected outside `MIN_TMP..=MAX_TMP` and in fan
    /// mode, where the unit has no setpoint to change.
    pub fn set_temp(&mut self, temp: i16) -> Result<(), CommandError> {
        self.ensure_ready()?;
        if !(MIN_TMP..=MAX_TMP).contains(&temp) {
            return Err(CommandError::InvalidArgument(format!(
                "temperature {temp} out of range {MIN_TMP}..={MAX_TMP}"
            )));
        }
        let mode = self.unit.mode.ok_or(CommandError::NotReady)?;
        if !matches!(mode, 0b001 | 0b010 | 0b100 | 0b101 | 0b110) {
            return Err(CommandError::InvalidArgument(format!(
                "setpoint not adjustable in {} mode",
                model::bits_to_text(Kind::Mode, mode)
            )));
        }
        let fan = self.unit.fan_lv.ok_or(CommandError::NotReady)?;
        let frame = Command::SetTemp { mode, fan, temp }.encode(self.addr);
        self.push(Work::Command {
            frame,
            confirm: Confirm::Temp(temp),
        });
        Ok(())
    }

    /// Switch energy-save mode by its short command (`"S"` on, `"R"` off).
    pub fn set_save(&mut self, cmd: &str) -> Result<(), CommandError> {
        self.ensure_ready()?;
        let save = model::cmd_to_bits(Kind::Save, cmd)?;
        let mode = self.unit.mode.ok_or(CommandError::NotReady)?;
        let fan = self.unit.fan_lv.ok_or(CommandError::NotReady)?;
        let temp = self.unit.temp1.ok_or(CommandError::NotReady)?;
        let frame = Command::SetSave { save, mode, fan, temp }.encode(self.addr);
        self.push(Work::Save { frame, target: save });
        Ok(())
    }

    /// Pursue a humidifier value (`"1"` on, `"0"` off).
    ///
    /// The unit only exposes a toggle, so the work item carries the desired
    /// value and the Humid state toggles until the model agrees.
    pub fn set_humid(&mut self, cmd: &str) -> Result<(), CommandError> {
        self.ensure_ready()?;
        let target = model::cmd_to_bits(Kind::Humid, cmd)?;
        let toggle = Command::ToggleHumid.encode(self.addr);
        self.push(Work::Humid { toggle, target });
        Ok(())
    }

    /// Clear the filter warning and its accumulated hours.
    pub fn reset_filter(&mut self) -> Result<(), CommandError> {
        self.ensure_ready()?;
        let frame = Command::ResetFilter.encode(self.addr);
        self.push(Work::Filter { frame });
        Ok(())
    }

    /// Query one sensor by id.
    pub fn sensor_query(&mut self, id: u8) -> Result<(), CommandError> {
        self.ensure_ready()?;
        if id == 0xFF {
            return Err(CommandError::InvalidArgument(format!(
                "sensor id 0x{id:02X} out of range"
            )));
        }
        let frame = Command::SensorQuery { id }.encode(self.addr);
        self.push(Work::Sensor { frame, id });
        Ok(())
    }

    /// Query one diagnostic id (`0x94` power levels, `0x9E` filter hours).
    pub fn extra_query(&mut self, id: u8) -> Result<(), CommandError> {
        self.ensure_ready()?;
        if id != EXTRA_POWER && id != EXTRA_FILTER {
            return Err(CommandError::InvalidArgument(format!(
                "unknown diagnostic query id 0x{id:02X}"
            )));
        }
        let frame = Command::ExtraQuery { id }.encode(self.addr);
        self.push(Work::Extra { frame, id });
        Ok(())
    }

    /// Abandon everything: drop queued work, clear the outstanding packet,
    /// and return to Start. No callback fires for the dropped work.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.waiting = None;
        self.update_pending = false;
        self.machine.reset();
        self.events.on_state_change(self.machine.state_name());
        self.events.on_start();
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    /// Feed one raw inbound frame.
    ///
    /// Malformed frames are dropped with a debug log; the session is
    /// otherwise unaffected. Broadcasts always update the model, even while a
    /// command is outstanding — that is how confirmation is observed.
    pub fn on_frame(&mut self, wire: &[u8], now: Instant) {
        let frame = match RawFrame::parse(wire) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping inbound frame: {e}");
                return;
            }
        };
        match frame.classify(self.addr) {
            FrameKind::Broadcast(kind) => {
                self.unit.apply_broadcast(kind, &frame.payload);
                self.events.on_status(&self.unit, kind);
                if self.machine.is_start() {
                    self.transition(State::Idle, now);
                    self.events.on_ready();
                }
                // Confirmation checks against the fresh model run on the
                // next tick.
            }
            FrameKind::Params => {
                let n = frame.payload.len().min(2);
                self.unit.params = Some(frame.payload[..n].to_vec());
            }
            FrameKind::Ack => match self.machine.state().clone() {
                State::Cmd { confirm } => {
                    self.transition(State::WStat { confirm }, now);
                }
                State::HmdTgl { target, toggle } => {
                    self.transition(State::Humid { target, toggle }, now);
                }
                _ => trace!("unexpected ack in state {}", self.machine.state_name()),
            },
            FrameKind::SensorReply => {
                if let State::Query1 { id } = *self.machine.state() {
                    match SensorReply::decode(&frame.payload) {
                        Ok(reply) => {
                            self.unit.sensor.insert(id, reply.reading);
                            self.transition(State::Idle, now);
                        }
                        Err(e) => debug!("dropping sensor reply: {e}"),
                    }
                }
            }
            FrameKind::ExtraReply => {
                if let State::Query2 { id } = *self.machine.state() {
                    match ExtraReply::decode(&frame.payload) {
                        Ok(reply) => {
                            match id {
                                EXTRA_POWER => {
                                    (self.unit.pwr_lv1, self.unit.pwr_lv2) = reply.power_levels();
                                }
                                EXTRA_FILTER => self.unit.filter_time = reply.filter_hours(),
                                _ => {}
                            }
                            self.unit.extra.insert(id, reply.raw);
                            self.transition(State::Idle, now);
                        }
                        Err(e) => debug!("dropping diagnostic reply: {e}"),
                    }
                }
            }
            FrameKind::Other => {}
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler tick
    // -----------------------------------------------------------------------

    /// One scheduler pass: flush the waiting packet, then service the
    /// current state — confirmations, timeouts, and idle dispatch.
    pub fn tick(&mut self, now: Instant) {
        self.flush();
        match self.machine.state().clone() {
            State::Start => {}
            State::Idle => self.idle_tick(now),
            State::Cmd { .. }
            | State::Query1 { .. }
            | State::Query2 { .. } => self.check_timeout(now),
            State::WStat { confirm } => {
                if confirm.satisfied(&self.unit) {
                    self.transition(State::Idle, now);
                } else if self.machine.expired(now) {
                    warn!("no confirmation from unit, resending command");
                    self.transition(State::Cmd { confirm }, now);
                    self.waiting = self.machine.outstanding().map(<[u8]>::to_vec);
                }
            }
            State::Ssave { target } => {
                if self.unit.save == Some(target) {
                    self.transition(State::Idle, now);
                } else {
                    self.check_timeout(now);
                }
            }
            State::Filter => {
                if self.unit.filter == Some(0) {
                    self.transition(State::Idle, now);
                } else {
                    self.check_timeout(now);
                }
            }
            State::Humid { target, toggle } => {
                if self.unit.humid == Some(target) || !self.humid_effective() {
                    self.transition(State::Idle, now);
                } else if self.machine.expired(now) {
                    warn!("humidifier unchanged, toggling again");
                    self.send_toggle(target, toggle, now);
                }
            }
            State::HmdTgl { .. } => self.check_timeout(now),
        }
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn ensure_ready(&self) -> Result<(), CommandError> {
        if self.machine.is_start() {
            Err(CommandError::NotReady)
        } else {
            Ok(())
        }
    }

    /// Append a work item, or absorb it when there is nowhere to transmit.
    fn push(&mut self, work: Work) {
        if self.sink.is_none() {
            // Listen-only: queries report a zero reading, everything else is
            // silently dropped.
            if let Work::Sensor { id, .. } = work {
                self.unit.sensor.insert(id, Some(0));
            }
            return;
        }
        self.queue.push_back(work);
    }

    fn transition(&mut self, next: State, now: Instant) {
        self.machine.enter(next, now);
        self.events.on_state_change(self.machine.state_name());
    }

    /// Hand the waiting packet to the sink. The sink is only ever touched
    /// here, from the tick.
    fn flush(&mut self) {
        if let Some(frame) = self.waiting.take()
            && let Some(sink) = self.sink.as_mut()
        {
            trace!("tx {}", hex(&frame));
            sink.transmit(&frame);
        }
    }

    /// Stage a frame for the next flush and remember it for retries.
    fn send(&mut self, frame: Vec<u8>) {
        self.waiting = Some(frame.clone());
        self.machine.arm(frame);
    }

    fn idle_tick(&mut self, now: Instant) {
        if let Some(work) = self.queue.pop_front() {
            match work {
                Work::Command { frame, confirm } => {
                    self.transition(State::Cmd { confirm }, now);
                    self.send(frame);
                }
                Work::Save { frame, target } => {
                    self.transition(State::Ssave { target }, now);
                    self.send(frame);
                }
                Work::Filter { frame } => {
                    self.transition(State::Filter, now);
                    self.send(frame);
                }
                Work::Sensor { frame, id } => {
                    self.transition(State::Query1 { id }, now);
                    self.send(frame);
                }
                Work::Extra { frame, id } => {
                    self.transition(State::Query2 { id }, now);
                    self.send(frame);
                }
                Work::Humid { toggle, target } => self.pursue_humid(target, toggle, now),
            }
            return;
        }
        if self.update_pending {
            self.update_pending = false;
            self.events.on_update(&self.unit);
            return;
        }
        if self
            .last_poll
            .is_none_or(|t| now.duration_since(t) >= self.poll_interval)
        {
            self.enqueue_poll();
            self.last_poll = Some(now);
            self.update_pending = true;
        }
    }

    fn enqueue_poll(&mut self) {
        for id in [EXTRA_POWER, EXTRA_FILTER] {
            let frame = Command::ExtraQuery { id }.encode(self.addr);
            self.push(Work::Extra { frame, id });
        }
        for id in POLL_SENSORS {
            let frame = Command::SensorQuery { id }.encode(self.addr);
            self.push(Work::Sensor { frame, id });
        }
    }

    /// The toggle only does anything in heat or auto-heat with power on.
    fn humid_effective(&self) -> bool {
        self.unit.power == Some(1) && matches!(self.unit.mode, Some(0b001) | Some(0b101))
    }

    /// Enter Humid: done or pointless pursuits fall straight through to
    /// Idle, otherwise fire a toggle.
    fn pursue_humid(&mut self, target: u8, toggle: Vec<u8>, now: Instant) {
        let done = self.unit.humid == Some(target);
        self.transition(
            State::Humid {
                target,
                toggle: toggle.clone(),
            },
            now,
        );
        if done || !self.humid_effective() {
            self.transition(State::Idle, now);
            return;
        }
        self.send_toggle(target, toggle, now);
    }

    fn send_toggle(&mut self, target: u8, toggle: Vec<u8>, now: Instant) {
        self.transition(
            State::HmdTgl {
                target,
                toggle: toggle.clone(),
            },
            now,
        );
        self.send(toggle);
    }

    /// Deadline bookkeeping for the retry-counted states.
    fn check_timeout(&mut self, now: Instant) {
        if !self.machine.expired(now) {
            return;
        }
        let name = self.machine.state_name();
        match self.machine.bump() {
            Retry::Silent => {
                debug!("{name}: no reply, retrying");
                self.retransmit(now);
            }
            Retry::Warn => {
                warn!("{name}: still no reply, retrying");
                self.retransmit(now);
            }
            Retry::GiveUp => {
                error!("{name}: unit not responding, abandoning packet");
                self.transition(State::Idle, now);
            }
        }
    }

    fn retransmit(&mut self, now: Instant) {
        self.waiting = self.machine.outstanding().map(<[u8]>::to_vec);
        self.machine.rearm_deadline(now);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
