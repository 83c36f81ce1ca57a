// Mac Plus quadrature mouse. Each axis is a pair of lines: the primary edge
// lands on an SCC DCD input (X on channel A, Y on channel B) and the
// secondary level on a VIA port B bit; the phase between them encodes the
// direction. Host deltas are halved to damp pointer jitter and converted
// into per-axis pulse trains on the scheduler, the two axes offset by half a
// slot so their edges never coincide. The button is VIA PB3, active low.

use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SLOT_CYCLES: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadMouse {
    slot_cycles: u64,
    x_pending: i32,
    y_pending: i32,
    x_primary: bool,
    y_primary: bool,
    x_secondary: bool,
    y_secondary: bool,
    button: bool,
}

// One quadrature step, handed to the bus to drive the SCC/VIA lines.
#[derive(Debug, Copy, Clone)]
pub struct AxisStep {
    pub primary: bool,
    pub secondary: bool,
}

impl QuadMouse {
    pub fn new() -> Self {
        QuadMouse {
            slot_cycles: DEFAULT_SLOT_CYCLES,
            x_pending: 0,
            y_pending: 0,
            x_primary: false,
            y_primary: false,
            x_secondary: false,
            y_secondary: false,
            button: false,
        }
    }

    pub fn set_slot_cycles(&mut self, cycles: u64) {
        self.slot_cycles = cycles.max(2);
    }

    pub fn set_button(&mut self, down: bool) {
        self.button = down;
    }

    // PB3 is active low.
    pub fn button_level(&self) -> bool {
        !self.button
    }

    pub fn move_by(&mut self, dx: i32, dy: i32, sched: &mut Scheduler) {
        // Halve to keep host jitter out of the pulse trains.
        let dx = dx / 2;
        let dy = dy / 2;
        if dx != 0 {
            let idle = self.x_pending == 0;
            self.x_pending += dx;
            if idle && self.x_pending != 0 && !sched.is_scheduled(EventKind::MouseX) {
                sched.schedule_cycles(EventKind::MouseX, 0, self.slot_cycles);
            }
        }
        if dy != 0 {
            let idle = self.y_pending == 0;
            self.y_pending += dy;
            if idle && self.y_pending != 0 && !sched.is_scheduled(EventKind::MouseY) {
                // Half a slot of offset keeps the axes' edges apart.
                sched.schedule_cycles(EventKind::MouseY, 0, self.slot_cycles / 2);
            }
        }
    }

    // One slot on the X axis: toggle the primary edge, phase the secondary
    // for the direction of travel, reschedule while pulses remain.
    pub fn x_step(&mut self, sched: &mut Scheduler) -> Option<AxisStep> {
        if self.x_pending == 0 {
            return None;
        }
        let rightward = self.x_pending > 0;
        self.x_pending -= if rightward { 1 } else { -1 };
        self.x_primary = !self.x_primary;
        self.x_secondary = if rightward { self.x_primary } else { !self.x_primary };
        if self.x_pending != 0 {
            sched.schedule_cycles(EventKind::MouseX, 0, self.slot_cycles);
        }
        Some(AxisStep { primary: self.x_primary, secondary: self.x_secondary })
    }

    pub fn y_step(&mut self, sched: &mut Scheduler) -> Option<AxisStep> {
        if self.y_pending == 0 {
            return None;
        }
        let downward = self.y_pending > 0;
        self.y_pending -= if downward { 1 } else { -1 };
        self.y_primary = !self.y_primary;
        self.y_secondary = if downward { !self.y_primary } else { self.y_primary };
        if self.y_pending != 0 {
            sched.schedule_cycles(EventKind::MouseY, 0, self.slot_cycles);
        }
        Some(AxisStep { primary: self.y_primary, secondary: self.y_secondary })
    }
}
