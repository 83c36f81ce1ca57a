// The discrete-event scheduler every device hangs off. Time is a single u64
// count of CPU cycles at the 7.8336 MHz reference clock; devices express
// delays in cycles or nanoseconds and get called back when the count passes
// their timestamp. The CPU advances time in sprints: the scheduler plans a
// bounded instruction batch, the CPU burns it down in place, and the queue is
// drained up to the new `now` after every sprint. The burndown counter lives
// here so that an MMIO handler running mid-sprint still sees a consistent
// clock.

use crate::logging::Cat;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;

pub const CLOCK_HZ: u64 = 7_833_600;
// One vertical blanking interval, ~60.15 Hz.
pub const VBL_PERIOD: u64 = 130_234;

const MAX_CYCLES: u64 = 1 << 60;
const EWMA_WEIGHT: f64 = 0.1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedMode {
    // As many VBL periods per host loop as fit in about half the loop time.
    MaxSpeed,
    // One VBL per host frame while the host frame is within +-50% of a VBL.
    RealTime,
    // Accumulate host time, consume it in whole VBLs; long-run wall alignment.
    HardwareAccuracy,
}

impl SpeedMode {
    pub fn cpi(&self) -> u64 {
        match *self {
            SpeedMode::MaxSpeed | SpeedMode::RealTime => 4,
            SpeedMode::HardwareAccuracy => 12,
        }
    }
}

// Every schedulable callback in the machine. The checkpoint format identifies
// a callback by a (source, event) name pair, so each variant maps to and from
// one; the u64 payload travels with the event untouched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    ViaT1 { via: u8 },
    ViaT2 { via: u8 },
    ViaShift { via: u8 },
    SccBrg { ch: u8 },
    RtcTick,
    IwmMotor { drive: u8 },
    MouseX,
    MouseY,
    KbdReply,
    KbdInquiryTimeout,
}

impl EventKind {
    pub fn names(&self) -> (&'static str, &'static str) {
        match *self {
            EventKind::ViaT1 { via: 0 } => ("via1", "t1"),
            EventKind::ViaT1 { .. } => ("via2", "t1"),
            EventKind::ViaT2 { via: 0 } => ("via1", "t2"),
            EventKind::ViaT2 { .. } => ("via2", "t2"),
            EventKind::ViaShift { via: 0 } => ("via1", "shift"),
            EventKind::ViaShift { .. } => ("via2", "shift"),
            EventKind::SccBrg { ch: 0 } => ("scc", "brg_a"),
            EventKind::SccBrg { .. } => ("scc", "brg_b"),
            EventKind::RtcTick => ("rtc", "tick"),
            EventKind::IwmMotor { drive: 0 } => ("iwm", "motor0"),
            EventKind::IwmMotor { .. } => ("iwm", "motor1"),
            EventKind::MouseX => ("mouse", "x_step"),
            EventKind::MouseY => ("mouse", "y_step"),
            EventKind::KbdReply => ("kbd", "reply"),
            EventKind::KbdInquiryTimeout => ("kbd", "inquiry_timeout"),
        }
    }
    pub fn from_names(source: &str, event: &str) -> Option<EventKind> {
        Some(match (source, event) {
            ("via1", "t1") => EventKind::ViaT1 { via: 0 },
            ("via2", "t1") => EventKind::ViaT1 { via: 1 },
            ("via1", "t2") => EventKind::ViaT2 { via: 0 },
            ("via2", "t2") => EventKind::ViaT2 { via: 1 },
            ("via1", "shift") => EventKind::ViaShift { via: 0 },
            ("via2", "shift") => EventKind::ViaShift { via: 1 },
            ("scc", "brg_a") => EventKind::SccBrg { ch: 0 },
            ("scc", "brg_b") => EventKind::SccBrg { ch: 1 },
            ("rtc", "tick") => EventKind::RtcTick,
            ("iwm", "motor0") => EventKind::IwmMotor { drive: 0 },
            ("iwm", "motor1") => EventKind::IwmMotor { drive: 1 },
            ("mouse", "x_step") => EventKind::MouseX,
            ("mouse", "y_step") => EventKind::MouseY,
            ("kbd", "reply") => EventKind::KbdReply,
            ("kbd", "inquiry_timeout") => EventKind::KbdInquiryTimeout,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Event {
    pub time: u64,
    pub seq: u64,
    pub kind: EventKind,
    pub data: u64,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest timestamp
// (FIFO among equals via seq) comes out first.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedEvent {
    pub time: u64,
    pub source: String,
    pub event: String,
    pub data: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub now: u64,
    pub total_instructions: u64,
    pub mode: SpeedMode,
    pub seq: u64,
    pub events: Vec<SavedEvent>,
}

pub struct Scheduler {
    now: u64,
    total_instructions: u64,
    mode: SpeedMode,
    stopped: bool,
    sprint_total: u64,
    // Decremented in place by the CPU, one per executed instruction.
    pub sprint_burndown: u64,
    seq: u64,
    queue: BinaryHeap<Event>,
    // Host pacing. None of this is machine state; a restored checkpoint
    // starts from fresh estimates.
    last_host_time: Option<f64>,
    last_vbls: u32,
    ewma_s_per_loop: f64,
    ewma_s_per_vbl: f64,
    vbl_error: f64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            now: 0,
            total_instructions: 0,
            mode: SpeedMode::RealTime,
            stopped: false,
            sprint_total: 0,
            sprint_burndown: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            last_host_time: None,
            last_vbls: 0,
            ewma_s_per_loop: 1.0 / 60.0,
            ewma_s_per_vbl: 1.0 / 600.0,
            vbl_error: 0.0,
        }
    }

    // Current cycle count, folding in-flight sprint progress so callbacks
    // scheduling relative delays mid-sprint use a consistent clock.
    pub fn cycles(&self) -> u64 {
        self.now + (self.sprint_total - self.sprint_burndown) * self.cpi()
    }

    pub fn cycles_ns(&self) -> u64 {
        (self.cycles() as u128 * 1_000_000_000 / CLOCK_HZ as u128) as u64
    }

    pub fn ns_to_cycles(ns: u64) -> u64 {
        (ns as u128 * CLOCK_HZ as u128 / 1_000_000_000) as u64
    }

    pub fn total_instructions(&self) -> u64 {
        self.total_instructions
    }

    pub fn cpi(&self) -> u64 {
        self.mode.cpi()
    }

    pub fn mode(&self) -> SpeedMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SpeedMode) {
        if self.mode != mode {
            maclog!(Cat::Sched, Info, "speed mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
            self.vbl_error = 0.0;
        }
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn clear_stop(&mut self) {
        self.stopped = false;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    // Exactly one of `cycles`/`ns` must be non-zero; anything else is a bug in
    // the caller, not a runtime condition.
    pub fn schedule(&mut self, kind: EventKind, data: u64, cycles: u64, ns: u64) {
        if (cycles == 0) == (ns == 0) {
            panic!("schedule {:?}: exactly one of cycles/ns must be set", kind);
        }
        let delay = if cycles != 0 { cycles } else { Self::ns_to_cycles(ns).max(1) };
        let time = self.cycles() + delay;
        self.seq += 1;
        self.queue.push(Event { time, seq: self.seq, kind, data });
        self.shorten_sprint(time);
    }

    // An MMIO handler can schedule from inside a sprint. If the new event
    // lands before the sprint's planned end, cut total and burndown by the
    // same amount: the executed count stays right and the CPU exits in time
    // for the drain to fire the event on schedule.
    fn shorten_sprint(&mut self, time: u64) {
        if self.sprint_total == 0 {
            return;
        }
        let cpi = self.cpi();
        let end = self.now + self.sprint_total * cpi;
        if time >= end {
            return;
        }
        let executed = self.sprint_total - self.sprint_burndown;
        let need = (time - self.now + cpi - 1) / cpi;
        let new_total = need.max(executed).min(self.sprint_total);
        let cut = self.sprint_total - new_total;
        self.sprint_total -= cut;
        self.sprint_burndown -= cut;
    }

    pub fn schedule_cycles(&mut self, kind: EventKind, data: u64, delay: u64) {
        self.schedule(kind, data, delay, 0);
    }

    pub fn schedule_ns(&mut self, kind: EventKind, data: u64, delay_ns: u64) {
        self.schedule(kind, data, 0, delay_ns);
    }

    pub fn remove(&mut self, kind: EventKind) {
        self.queue.retain(|e| e.kind != kind);
    }

    pub fn remove_by_data(&mut self, kind: EventKind, data: u64) {
        self.queue.retain(|e| e.kind != kind || e.data != data);
    }

    pub fn is_scheduled(&self, kind: EventKind) -> bool {
        self.queue.iter().any(|e| e.kind == kind)
    }

    // Plan the next sprint: whichever is smaller of the caller's instruction
    // budget and the distance to the next event, at least one instruction if
    // any cycles remain. Returns 0 when an event is already due (drain first)
    // or the budget is exhausted.
    pub fn begin_sprint(&mut self, budget_instr: u64, single_step: bool) -> u64 {
        debug_assert!(self.sprint_total == 0, "sprint already in flight");
        if self.stopped || budget_instr == 0 {
            return 0;
        }
        let cpi = self.cpi();
        let delay = match self.queue.peek() {
            Some(head) => head.time.saturating_sub(self.now),
            None => u64::MAX,
        };
        let mut instr = if delay == u64::MAX {
            budget_instr
        } else if delay == 0 {
            return 0;
        } else {
            budget_instr.min(((delay + cpi - 1) / cpi).max(1))
        };
        if single_step {
            instr = 1;
        }
        self.sprint_total = instr;
        self.sprint_burndown = instr;
        instr
    }

    // Close the sprint the CPU just ran and advance time by what it actually
    // executed. The CPU may stop early (trap, breakpoint), so the burndown
    // can be anywhere in [0, sprint_total].
    pub fn end_sprint(&mut self) -> u64 {
        assert!(self.sprint_burndown <= self.sprint_total, "burndown overran sprint");
        let executed = self.sprint_total - self.sprint_burndown;
        self.now += executed * self.cpi();
        self.total_instructions += executed;
        self.sprint_total = 0;
        self.sprint_burndown = 0;
        assert!(self.now < MAX_CYCLES, "cycle counter out of range");
        if let Some(head) = self.queue.peek() {
            // One instruction of overshoot is legal; more means the plan was wrong.
            assert!(head.time + self.cpi() >= self.now, "event queue fell behind");
        }
        executed
    }

    pub fn pop_due(&mut self) -> Option<Event> {
        match self.queue.peek() {
            Some(head) if head.time <= self.now => self.queue.pop(),
            _ => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    // Called from the host's frame callback with its clock in seconds.
    // Returns how many VBL periods to emulate this loop.
    pub fn main_loop(&mut self, host_time: f64) -> u32 {
        let vbl_s = VBL_PERIOD as f64 / CLOCK_HZ as f64;
        let dt = match self.last_host_time {
            None => {
                self.last_host_time = Some(host_time);
                self.last_vbls = 1;
                return 1;
            }
            Some(t) => (host_time - t).max(0.0).min(0.5),
        };
        self.last_host_time = Some(host_time);
        self.ewma_s_per_loop =
            self.ewma_s_per_loop * (1.0 - EWMA_WEIGHT) + dt * EWMA_WEIGHT;
        if self.last_vbls > 0 {
            let per_vbl = dt / self.last_vbls as f64;
            self.ewma_s_per_vbl =
                self.ewma_s_per_vbl * (1.0 - EWMA_WEIGHT) + per_vbl * EWMA_WEIGHT;
        }
        let vbls = match self.mode {
            SpeedMode::MaxSpeed => {
                let budget = self.ewma_s_per_loop * 0.5;
                ((budget / self.ewma_s_per_vbl.max(1e-6)) as u32).max(1)
            }
            SpeedMode::RealTime => {
                if dt > 0.5 * vbl_s && dt < 1.5 * vbl_s {
                    1
                } else {
                    ((dt / vbl_s).round() as u32).min(4).max(1)
                }
            }
            SpeedMode::HardwareAccuracy => {
                self.vbl_error += dt;
                let n = (self.vbl_error / vbl_s) as u32;
                self.vbl_error -= n as f64 * vbl_s;
                n
            }
        };
        self.last_vbls = vbls;
        vbls
    }

    pub fn save_state(&self) -> SchedulerState {
        let mut events: Vec<&Event> = self.queue.iter().collect();
        events.sort_by_key(|e| (e.time, e.seq));
        SchedulerState {
            now: self.now,
            total_instructions: self.total_instructions,
            mode: self.mode,
            seq: self.seq,
            events: events
                .into_iter()
                .map(|e| {
                    let (source, event) = e.kind.names();
                    SavedEvent {
                        time: e.time,
                        source: source.to_string(),
                        event: event.to_string(),
                        data: e.data,
                    }
                })
                .collect(),
        }
    }

    pub fn restore(&mut self, state: &SchedulerState) -> Result<(), crate::error::Error> {
        let mut queue = BinaryHeap::with_capacity(state.events.len());
        let mut seq = 0u64;
        for saved in &state.events {
            let kind = EventKind::from_names(&saved.source, &saved.event).ok_or_else(|| {
                crate::error::Error::UnknownEvent {
                    source_id: saved.source.clone(),
                    event: saved.event.clone(),
                }
            })?;
            seq += 1;
            queue.push(Event { time: saved.time, seq, kind, data: saved.data });
        }
        self.now = state.now;
        self.total_instructions = state.total_instructions;
        self.mode = state.mode;
        self.seq = state.seq.max(seq);
        self.queue = queue;
        self.stopped = false;
        self.sprint_total = 0;
        self.sprint_burndown = 0;
        self.last_host_time = None;
        self.last_vbls = 0;
        self.ewma_s_per_loop = 1.0 / 60.0;
        self.ewma_s_per_vbl = 1.0 / 600.0;
        self.vbl_error = 0.0;
        Ok(())
    }
}
