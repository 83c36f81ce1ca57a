// VIA 6522. Sixteen byte-wide registers selected by address lines 9-12, two
// timers counting at a tenth of the CPU clock, a shift register wired to the
// keyboard (Plus) or ADB transceiver (SE/30), and the interrupt flag/enable
// pair whose masked OR is the chip's IRQ line. Timer and shift completion are
// scheduler events instead of per-tick countdowns; a counter read computes
// the live value from the cycle count at arm time.

use crate::logging::Cat;
use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

// Register indices, address bits 12:9.
pub const REG_ORB: usize = 0;
pub const REG_ORA: usize = 1;
pub const REG_DDRB: usize = 2;
pub const REG_DDRA: usize = 3;
pub const REG_T1C_L: usize = 4;
pub const REG_T1C_H: usize = 5;
pub const REG_T1L_L: usize = 6;
pub const REG_T1L_H: usize = 7;
pub const REG_T2C_L: usize = 8;
pub const REG_T2C_H: usize = 9;
pub const REG_SR: usize = 10;
pub const REG_ACR: usize = 11;
pub const REG_PCR: usize = 12;
pub const REG_IFR: usize = 13;
pub const REG_IER: usize = 14;
pub const REG_ORA_NOHS: usize = 15;

// IFR/IER bit positions.
pub const IRQ_CA2: u8 = 1 << 0;
pub const IRQ_CA1: u8 = 1 << 1;
pub const IRQ_SR: u8 = 1 << 2;
pub const IRQ_CB2: u8 = 1 << 3;
pub const IRQ_CB1: u8 = 1 << 4;
pub const IRQ_T2: u8 = 1 << 5;
pub const IRQ_T1: u8 = 1 << 6;

// The timers tick on the E clock, CPU/10.
const TIMER_DIV: u64 = 10;
// A full shift takes 8 VIA cycles.
const SHIFT_CYCLES: u64 = 8 * TIMER_DIV;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Port {
    A,
    B,
}

// Handed back to the bus when a port write changes the driven value.
#[derive(Debug, Copy, Clone)]
pub struct PortOut {
    pub port: Port,
    pub value: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Via {
    id: u8,
    ora: u8,
    orb: u8,
    ira: u8,
    irb: u8,
    ddra: u8,
    ddrb: u8,
    acr: u8,
    pcr: u8,
    ifr: u8,
    ier: u8,
    sr: u8,
    t1_latch: u16,
    t1_start: u16,
    t1_armed_at: u64,
    t1_running: bool,
    t1_pb7: bool,
    t2_latch_lo: u8,
    t2_start: u16,
    t2_armed_at: u64,
    t2_irq_armed: bool,
    sr_shifting: bool,
    ca1: bool,
    ca2: bool,
    cb1: bool,
    cb2: bool,
}

impl Via {
    pub fn new(id: u8) -> Self {
        Via {
            id,
            ora: 0,
            orb: 0,
            ira: 0xFF,
            irb: 0xFF,
            ddra: 0,
            ddrb: 0,
            acr: 0,
            pcr: 0,
            ifr: 0,
            ier: 0,
            sr: 0,
            t1_latch: 0xFFFF,
            t1_start: 0xFFFF,
            t1_armed_at: 0,
            t1_running: false,
            t1_pb7: false,
            t2_latch_lo: 0,
            t2_start: 0xFFFF,
            t2_armed_at: 0,
            t2_irq_armed: false,
            sr_shifting: false,
            ca1: false,
            ca2: false,
            cb1: true,
            cb2: true,
        }
    }

    pub fn irq_asserted(&self) -> bool {
        self.ifr & self.ier & 0x7F != 0
    }

    fn set_ifr(&mut self, bits: u8) {
        self.ifr |= bits & 0x7F;
    }

    fn clear_ifr(&mut self, bits: u8) {
        self.ifr &= !(bits & 0x7F);
    }

    fn timer_ticks(&self, armed_at: u64, now: u64) -> u16 {
        ((now.saturating_sub(armed_at)) / TIMER_DIV) as u16
    }

    fn t1_counter(&self, now: u64) -> u16 {
        self.t1_start.wrapping_sub(self.timer_ticks(self.t1_armed_at, now))
    }

    fn t2_counter(&self, now: u64) -> u16 {
        if self.acr & 0x20 != 0 {
            // Pulse-count mode decrements on PB6 edges only.
            self.t2_start
        } else {
            self.t2_start.wrapping_sub(self.timer_ticks(self.t2_armed_at, now))
        }
    }

    fn port_a(&self) -> u8 {
        (self.ora & self.ddra) | (self.ira & !self.ddra)
    }

    fn port_b(&self) -> u8 {
        let mut value = (self.orb & self.ddrb) | (self.irb & !self.ddrb);
        if self.acr & 0x80 != 0 && self.ddrb & 0x80 != 0 {
            value = (value & 0x7F) | ((self.t1_pb7 as u8) << 7);
        }
        value
    }

    pub fn read(&mut self, reg: usize, sched: &mut Scheduler) -> u8 {
        let now = sched.cycles();
        match reg {
            REG_ORB => {
                self.clear_ifr(IRQ_CB1 | IRQ_CB2);
                self.port_b()
            }
            REG_ORA | REG_ORA_NOHS => {
                if reg == REG_ORA {
                    self.clear_ifr(IRQ_CA1 | IRQ_CA2);
                }
                self.port_a()
            }
            REG_DDRB => self.ddrb,
            REG_DDRA => self.ddra,
            REG_T1C_L => {
                self.clear_ifr(IRQ_T1);
                (self.t1_counter(now) & 0xFF) as u8
            }
            REG_T1C_H => (self.t1_counter(now) >> 8) as u8,
            REG_T1L_L => (self.t1_latch & 0xFF) as u8,
            REG_T1L_H => (self.t1_latch >> 8) as u8,
            REG_T2C_L => {
                self.clear_ifr(IRQ_T2);
                (self.t2_counter(now) & 0xFF) as u8
            }
            REG_T2C_H => (self.t2_counter(now) >> 8) as u8,
            REG_SR => {
                self.clear_ifr(IRQ_SR);
                self.sr
            }
            REG_ACR => self.acr,
            REG_PCR => self.pcr,
            REG_IFR => {
                let mut value = self.ifr;
                if self.irq_asserted() {
                    value |= 0x80;
                }
                value
            }
            REG_IER => self.ier | 0x80,
            _ => unreachable!("register index is 4 bits"),
        }
    }

    pub fn write(&mut self, reg: usize, value: u8, sched: &mut Scheduler) -> Option<PortOut> {
        let now = sched.cycles();
        match reg {
            REG_ORB => {
                self.clear_ifr(IRQ_CB1 | IRQ_CB2);
                self.orb = value;
                return Some(PortOut { port: Port::B, value: self.port_b() });
            }
            REG_ORA | REG_ORA_NOHS => {
                if reg == REG_ORA {
                    self.clear_ifr(IRQ_CA1 | IRQ_CA2);
                }
                self.ora = value;
                return Some(PortOut { port: Port::A, value: self.port_a() });
            }
            REG_DDRB => {
                self.ddrb = value;
                return Some(PortOut { port: Port::B, value: self.port_b() });
            }
            REG_DDRA => {
                self.ddra = value;
                return Some(PortOut { port: Port::A, value: self.port_a() });
            }
            REG_T1C_L | REG_T1L_L => {
                self.t1_latch = (self.t1_latch & 0xFF00) | value as u16;
            }
            REG_T1L_H => {
                self.t1_latch = (self.t1_latch & 0x00FF) | ((value as u16) << 8);
                self.clear_ifr(IRQ_T1);
            }
            REG_T1C_H => {
                self.t1_latch = (self.t1_latch & 0x00FF) | ((value as u16) << 8);
                self.t1_start = self.t1_latch;
                self.t1_armed_at = now;
                self.t1_running = true;
                self.clear_ifr(IRQ_T1);
                if self.acr & 0x80 != 0 {
                    self.t1_pb7 = false;
                }
                sched.remove(EventKind::ViaT1 { via: self.id });
                let delay = (self.t1_latch as u64 + 1) * TIMER_DIV;
                sched.schedule_cycles(EventKind::ViaT1 { via: self.id }, 0, delay);
                maclog!(Cat::Via, Trace, "via{} T1 armed, {} cycles", self.id + 1, delay);
            }
            REG_T2C_L => {
                self.t2_latch_lo = value;
            }
            REG_T2C_H => {
                self.t2_start = ((value as u16) << 8) | self.t2_latch_lo as u16;
                self.t2_armed_at = now;
                self.t2_irq_armed = true;
                self.clear_ifr(IRQ_T2);
                sched.remove(EventKind::ViaT2 { via: self.id });
                if self.acr & 0x20 == 0 {
                    let delay = (self.t2_start as u64 + 1) * TIMER_DIV;
                    sched.schedule_cycles(EventKind::ViaT2 { via: self.id }, 0, delay);
                }
            }
            REG_SR => {
                self.sr = value;
                self.clear_ifr(IRQ_SR);
                if self.acr & 0x10 != 0 {
                    // Shift out: completion delivers the byte to the wired device.
                    self.sr_shifting = true;
                    sched.remove(EventKind::ViaShift { via: self.id });
                    sched.schedule_cycles(EventKind::ViaShift { via: self.id }, 0, SHIFT_CYCLES);
                }
            }
            REG_ACR => {
                let old_mode = self.acr & 0x1C;
                self.acr = value;
                if self.sr_shifting && (value & 0x1C) != old_mode {
                    // Mode change mid-shift cancels the pending completion.
                    self.sr_shifting = false;
                    sched.remove(EventKind::ViaShift { via: self.id });
                }
            }
            REG_PCR => self.pcr = value,
            REG_IFR => self.clear_ifr(value),
            REG_IER => {
                if value & 0x80 != 0 {
                    self.ier |= value & 0x7F;
                } else {
                    self.ier &= !(value & 0x7F);
                }
            }
            _ => unreachable!("register index is 4 bits"),
        }
        None
    }

    // T1 expiry callback. Free-running modes rearm; PB7 modes drive bit 7.
    pub fn t1_expired(&mut self, sched: &mut Scheduler) {
        self.set_ifr(IRQ_T1);
        match self.acr >> 6 {
            0b01 | 0b11 => {
                if self.acr & 0x80 != 0 {
                    self.t1_pb7 = !self.t1_pb7;
                }
                self.t1_start = self.t1_latch;
                self.t1_armed_at = sched.cycles();
                let delay = ((self.t1_latch as u64 + 1) * TIMER_DIV).max(1);
                sched.schedule_cycles(EventKind::ViaT1 { via: self.id }, 0, delay);
            }
            _ => {
                if self.acr & 0x80 != 0 {
                    self.t1_pb7 = true;
                }
                self.t1_running = false;
            }
        }
    }

    // T2 expiry: the interrupt fires exactly once per arm even though the
    // counter keeps decrementing.
    pub fn t2_expired(&mut self) {
        if self.t2_irq_armed {
            self.set_ifr(IRQ_T2);
            self.t2_irq_armed = false;
        }
    }

    // Shift completion: hand the byte to the bus for delivery to the wired
    // device, flag the interrupt.
    pub fn shift_done(&mut self) -> Option<u8> {
        if !self.sr_shifting {
            return None;
        }
        self.sr_shifting = false;
        self.set_ifr(IRQ_SR);
        Some(self.sr)
    }

    // External shift-in (keyboard reply, ADB response byte).
    pub fn input_sr(&mut self, value: u8) {
        if self.acr & 0x10 != 0 {
            maclog!(Cat::Via, Debug, "via{} shift-in while in output mode", self.id + 1);
        }
        self.sr = value;
        self.set_ifr(IRQ_SR);
    }

    pub fn sr_value(&self) -> u8 {
        self.sr
    }

    // Input port levels, driven by external wiring.
    pub fn set_in_a(&mut self, mask: u8, levels: u8) {
        self.ira = (self.ira & !mask) | (levels & mask);
    }

    pub fn set_in_b(&mut self, mask: u8, levels: u8) {
        self.irb = (self.irb & !mask) | (levels & mask);
    }

    pub fn out_a(&self) -> u8 {
        self.port_a()
    }

    pub fn out_b(&self) -> u8 {
        self.port_b()
    }

    pub fn set_ca1(&mut self, level: bool) {
        let rising = self.pcr & 0x01 != 0;
        if level != self.ca1 && level == rising {
            self.set_ifr(IRQ_CA1);
        }
        self.ca1 = level;
    }

    pub fn set_ca2(&mut self, level: bool) {
        if self.pcr & 0x08 == 0 {
            let rising = self.pcr & 0x04 != 0;
            if level != self.ca2 && level == rising {
                self.set_ifr(IRQ_CA2);
            }
        }
        self.ca2 = level;
    }

    pub fn set_cb1(&mut self, level: bool) {
        let rising = self.pcr & 0x10 != 0;
        if level != self.cb1 && level == rising {
            self.set_ifr(IRQ_CB1);
        }
        self.cb1 = level;
    }

    pub fn set_cb2(&mut self, level: bool) {
        if self.pcr & 0x80 == 0 {
            let rising = self.pcr & 0x40 != 0;
            if level != self.cb2 && level == rising {
                self.set_ifr(IRQ_CB2);
            }
        }
        self.cb2 = level;
    }

    // PB6 pulse counting for T2 mode 1.
    pub fn pulse_pb6(&mut self) {
        if self.acr & 0x20 != 0 {
            self.t2_start = self.t2_start.wrapping_sub(1);
            if self.t2_start == 0xFFFF {
                self.t2_expired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Event;

    fn advance(s: &mut Scheduler, cycles: u64) -> Vec<Event> {
        let mut fired = Vec::new();
        let target = s.cycles() + cycles;
        while s.cycles() < target {
            let budget = (target - s.cycles() + s.cpi() - 1) / s.cpi();
            let planned = s.begin_sprint(budget, false);
            if planned > 0 {
                s.sprint_burndown = 0;
                s.end_sprint();
            }
            while let Some(e) = s.pop_due() {
                fired.push(e);
            }
        }
        fired
    }

    fn dispatch(via: &mut Via, sched: &mut Scheduler, events: Vec<Event>) {
        for ev in events {
            match ev.kind {
                EventKind::ViaT1 { .. } => via.t1_expired(sched),
                EventKind::ViaT2 { .. } => via.t2_expired(),
                EventKind::ViaShift { .. } => {
                    via.shift_done();
                }
                _ => {}
            }
        }
    }

    #[test]
    fn t1_one_shot_fires_at_n_plus_one_times_ten() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_IER, 0x80 | IRQ_T1, &mut s);
        via.write(REG_T1C_L, 0xFF, &mut s);
        via.write(REG_T1C_H, 0x00, &mut s);
        // counter = 0x00FF, expiry at 256 * 10 = 2560 cycles
        let fired = advance(&mut s, 2556);
        assert!(fired.is_empty());
        assert_eq!(via.ifr & IRQ_T1, 0);
        let fired = advance(&mut s, 8);
        dispatch(&mut via, &mut s, fired);
        assert_ne!(via.ifr & IRQ_T1, 0);
        assert!(via.irq_asserted());
    }

    #[test]
    fn t1_free_running_rearms() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_ACR, 0x40, &mut s);
        via.write(REG_T1C_L, 0x09, &mut s);
        via.write(REG_T1C_H, 0x00, &mut s);
        // period (9+1)*10 = 100 cycles
        for _ in 0..3 {
            let fired = advance(&mut s, 100);
            assert_eq!(fired.len(), 1);
            dispatch(&mut via, &mut s, fired);
            assert_ne!(via.ifr & IRQ_T1, 0);
            via.read(REG_T1C_L, &mut s); // read clears
            assert_eq!(via.ifr & IRQ_T1, 0);
        }
    }

    #[test]
    fn t2_interrupts_once_but_keeps_counting() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_T2C_L, 0x04, &mut s);
        via.write(REG_T2C_H, 0x00, &mut s);
        let fired = advance(&mut s, 50);
        dispatch(&mut via, &mut s, fired);
        assert_ne!(via.ifr & IRQ_T2, 0);
        via.read(REG_T2C_L, &mut s);
        assert_eq!(via.ifr & IRQ_T2, 0);
        // counter wrapped past zero and keeps going without a second flag
        advance(&mut s, 1000);
        assert_eq!(via.ifr & IRQ_T2, 0);
        let lo = via.read(REG_T2C_L, &mut s);
        let hi = via.read(REG_T2C_H, &mut s);
        assert_ne!(((hi as u16) << 8) | lo as u16, 4);
    }

    #[test]
    fn live_counter_read() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_T1C_L, 0xE8, &mut s);
        via.write(REG_T1C_H, 0x03, &mut s); // 1000
        advance(&mut s, 400); // 40 timer ticks
        let lo = via.read(REG_T1C_L, &mut s) as u16;
        let hi = via.read(REG_T1C_H, &mut s) as u16;
        assert_eq!((hi << 8) | lo, 960);
    }

    #[test]
    fn shift_out_completes_after_eight_via_cycles() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_ACR, 0x1C, &mut s); // shift out
        via.write(REG_SR, 0x5A, &mut s);
        let fired = advance(&mut s, 80);
        assert_eq!(fired.len(), 1);
        assert_eq!(via.shift_done(), Some(0x5A));
        assert_ne!(via.ifr & IRQ_SR, 0);
    }

    #[test]
    fn acr_change_cancels_pending_shift() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_ACR, 0x1C, &mut s);
        via.write(REG_SR, 0x5A, &mut s);
        via.write(REG_ACR, 0x0C, &mut s); // back to shift-in
        assert!(!s.is_scheduled(EventKind::ViaShift { via: 0 }));
        assert!(advance(&mut s, 200).is_empty());
    }

    #[test]
    fn port_read_mixes_by_direction() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_DDRA, 0xF0, &mut s);
        via.write(REG_ORA, 0xAA, &mut s);
        via.set_in_a(0x0F, 0x05);
        assert_eq!(via.read(REG_ORA, &mut s), 0xA5);
    }

    #[test]
    fn ifr_bit7_is_masked_or() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.set_ifr(IRQ_CA1);
        assert_eq!(via.read(REG_IFR, &mut s) & 0x80, 0);
        via.write(REG_IER, 0x80 | IRQ_CA1, &mut s);
        assert_ne!(via.read(REG_IFR, &mut s) & 0x80, 0);
        via.write(REG_IFR, IRQ_CA1, &mut s);
        assert!(!via.irq_asserted());
    }

    #[test]
    fn ca1_edge_respects_pcr() {
        let mut s = Scheduler::new();
        let mut via = Via::new(0);
        via.write(REG_PCR, 0x01, &mut s); // rising edge
        via.set_ca1(true);
        assert_ne!(via.ifr & IRQ_CA1, 0);
        via.write(REG_IFR, IRQ_CA1, &mut s);
        via.set_ca1(false); // falling, ignored
        assert_eq!(via.ifr & IRQ_CA1, 0);
    }
}
