// Zilog 8530 serial controller. Two channels behind a write-register pointer;
// register 2 (vector) and register 9 (master interrupt enable, resets) are
// chip-global. Channel B in SDLC mode is the interesting path on a Mac: it
// carries AppleTalk frames, and the mouse interrupts arrive as DCD edges on
// both channels. Inbound frames queue up outside the chip and get pumped into
// the RX FIFO whenever the receiver is hunting.

use crate::logging::Cat;
use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

pub const CH_A: usize = 0;
pub const CH_B: usize = 1;

const MAX_FRAMES: usize = 8;
const MAX_FRAME_LEN: usize = 1024;

// RR3 interrupt-pending bits (read on channel A).
const RR3_B_EXT: u8 = 1 << 0;
const RR3_B_TX: u8 = 1 << 1;
const RR3_B_RX: u8 = 1 << 2;
const RR3_A_EXT: u8 = 1 << 3;
const RR3_A_TX: u8 = 1 << 4;
const RR3_A_RX: u8 = 1 << 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    wr: Vec<u8>,
    rx_fifo: Vec<u8>,
    frames: Vec<Vec<u8>>,
    hunt: bool,
    char_avail: bool,
    eof: bool,
    dcd: bool,
    brg_running: bool,
}

impl Channel {
    fn new() -> Self {
        Channel {
            wr: vec![0; 16],
            rx_fifo: Vec::new(),
            frames: Vec::new(),
            hunt: false,
            char_avail: false,
            eof: false,
            dcd: false,
            brg_running: false,
        }
    }

    fn reset(&mut self) {
        let dcd = self.dcd;
        *self = Channel::new();
        self.dcd = dcd;
    }

    fn rx_enabled(&self) -> bool {
        self.wr[3] & 0x01 != 0
    }

    fn addr_search(&self) -> bool {
        self.wr[3] & 0x04 != 0
    }

    fn rx_int_enabled(&self) -> bool {
        self.wr[1] & 0x18 != 0
    }

    fn ext_int_enabled(&self) -> bool {
        self.wr[1] & 0x01 != 0
    }

    fn brg_time_constant(&self) -> u16 {
        ((self.wr[13] as u16) << 8) | self.wr[12] as u16
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scc {
    channels: Vec<Channel>,
    vector: u8,
    mie: bool,
    reg_ptr: u8,
    ptr_armed: bool,
    rr3: u8,
}

impl Scc {
    pub fn new() -> Self {
        Scc {
            channels: vec![Channel::new(), Channel::new()],
            vector: 0,
            mie: false,
            reg_ptr: 0,
            ptr_armed: false,
            rr3: 0,
        }
    }

    pub fn irq_asserted(&self) -> bool {
        self.mie && self.rr3 != 0
    }

    // MMIO entry points. Address bit 1 selects the channel (B at even,
    // A at odd), bit 2 control vs data.
    pub fn read(&mut self, offset: u32, sched: &mut Scheduler) -> u8 {
        let ch = if offset & 0x2 != 0 { CH_A } else { CH_B };
        if offset & 0x4 != 0 {
            self.read_data(ch)
        } else {
            let reg = if self.ptr_armed { self.reg_ptr } else { 0 };
            self.ptr_armed = false;
            self.reg_ptr = 0;
            let _ = sched;
            self.read_reg(ch, reg as usize)
        }
    }

    pub fn write(&mut self, offset: u32, value: u8, sched: &mut Scheduler) {
        let ch = if offset & 0x2 != 0 { CH_A } else { CH_B };
        if offset & 0x4 != 0 {
            self.write_data(ch, value);
        } else if !self.ptr_armed {
            self.reg_ptr = value & 0x07;
            if value & 0x38 == 0x08 {
                // Point High command
                self.reg_ptr |= 8;
            }
            self.ptr_armed = true;
            self.wr0_command(ch, value);
        } else {
            let reg = self.reg_ptr as usize;
            self.ptr_armed = false;
            self.reg_ptr = 0;
            self.write_reg(ch, reg, value, sched);
        }
    }

    fn wr0_command(&mut self, ch: usize, value: u8) {
        match (value >> 3) & 0x07 {
            0b010 => {
                // reset ext/status interrupts
                let bit = if ch == CH_A { RR3_A_EXT } else { RR3_B_EXT };
                self.rr3 &= !bit;
            }
            0b110 => {
                // error reset
                self.channels[ch].eof = false;
            }
            _ => {}
        }
    }

    fn read_reg(&mut self, ch: usize, reg: usize) -> u8 {
        match reg {
            0 => {
                let c = &self.channels[ch];
                let mut v = 0u8;
                if c.char_avail {
                    v |= 0x01;
                }
                if c.dcd {
                    v |= 0x08;
                }
                if c.hunt {
                    v |= 0x10;
                }
                v | 0x04 // tx buffer always empty
            }
            1 => {
                let c = &self.channels[ch];
                let mut v = 0x01; // all sent
                if c.eof {
                    v |= 0x80;
                }
                v
            }
            2 => {
                if ch == CH_A {
                    self.vector
                } else {
                    self.modified_vector()
                }
            }
            3 => {
                if ch == CH_A {
                    self.rr3
                } else {
                    0
                }
            }
            8 => self.read_data(ch),
            10 => 0,
            12 => self.channels[ch].wr[12],
            13 => self.channels[ch].wr[13],
            15 => self.channels[ch].wr[15],
            _ => {
                maclog!(Cat::Scc, Debug, "read of unimplemented RR{}", reg);
                0
            }
        }
    }

    // Channel B's RR2 carries the vector with bits 3:1 replaced by the
    // highest-priority pending condition.
    fn modified_vector(&self) -> u8 {
        let status = if self.rr3 & RR3_A_RX != 0 {
            0b110
        } else if self.rr3 & RR3_A_TX != 0 {
            0b100
        } else if self.rr3 & RR3_A_EXT != 0 {
            0b101
        } else if self.rr3 & RR3_B_RX != 0 {
            0b010
        } else if self.rr3 & RR3_B_TX != 0 {
            0b000
        } else if self.rr3 & RR3_B_EXT != 0 {
            0b001
        } else {
            0b011 // no interrupt pending
        };
        (self.vector & !0x0E) | (status << 1)
    }

    fn write_reg(&mut self, ch: usize, reg: usize, value: u8, sched: &mut Scheduler) {
        match reg {
            2 => self.vector = value,
            9 => {
                self.mie = value & 0x08 != 0;
                match value >> 6 {
                    0b01 => self.channel_reset(CH_B, sched),
                    0b10 => self.channel_reset(CH_A, sched),
                    0b11 => {
                        self.channel_reset(CH_A, sched);
                        self.channel_reset(CH_B, sched);
                        self.rr3 = 0;
                    }
                    _ => {}
                }
            }
            3 => {
                let was_enabled = self.channels[ch].rx_enabled();
                self.channels[ch].wr[3] = value;
                if !was_enabled && self.channels[ch].rx_enabled() {
                    self.channels[ch].hunt = true;
                    self.pump(ch);
                } else if !self.channels[ch].rx_enabled() {
                    self.channels[ch].hunt = false;
                }
            }
            14 => {
                let was_running = self.channels[ch].brg_running;
                self.channels[ch].wr[14] = value;
                let enable = value & 0x01 != 0;
                if enable && !was_running {
                    self.channels[ch].brg_running = true;
                    let period = self.channels[ch].brg_time_constant() as u64 + 1;
                    sched.schedule_cycles(EventKind::SccBrg { ch: ch as u8 }, 0, period);
                } else if !enable && was_running {
                    self.channels[ch].brg_running = false;
                    sched.remove(EventKind::SccBrg { ch: ch as u8 });
                }
            }
            _ => {
                if reg < 16 {
                    self.channels[ch].wr[reg] = value;
                } else {
                    maclog!(Cat::Scc, Debug, "write of unimplemented WR{}", reg);
                }
            }
        }
    }

    fn channel_reset(&mut self, ch: usize, sched: &mut Scheduler) {
        self.channels[ch].reset();
        sched.remove(EventKind::SccBrg { ch: ch as u8 });
        let mask = if ch == CH_A {
            RR3_A_EXT | RR3_A_TX | RR3_A_RX
        } else {
            RR3_B_EXT | RR3_B_TX | RR3_B_RX
        };
        self.rr3 &= !mask;
    }

    // BRG zero-count callback; reschedules itself while enabled.
    pub fn brg_zero_count(&mut self, ch: usize, sched: &mut Scheduler) {
        if !self.channels[ch].brg_running {
            return;
        }
        let period = self.channels[ch].brg_time_constant() as u64 + 1;
        sched.schedule_cycles(EventKind::SccBrg { ch: ch as u8 }, 0, period);
        // WR15 bit 1: zero-count interrupt enable
        if self.channels[ch].wr[15] & 0x02 != 0 && self.channels[ch].ext_int_enabled() {
            self.rr3 |= if ch == CH_A { RR3_A_EXT } else { RR3_B_EXT };
        }
    }

    fn read_data(&mut self, ch: usize) -> u8 {
        let c = &mut self.channels[ch];
        if c.rx_fifo.is_empty() {
            return 0xFF;
        }
        let byte = c.rx_fifo.remove(0);
        if c.rx_fifo.is_empty() {
            // End of frame rides out on the last byte; hunt re-enters.
            c.eof = true;
            c.char_avail = false;
            c.hunt = true;
            self.pump(ch);
        }
        byte
    }

    fn write_data(&mut self, ch: usize, value: u8) {
        if self.channels[ch].wr[14] & 0x10 != 0 {
            // Local loopback routes TX straight back into RX.
            let c = &mut self.channels[ch];
            c.rx_fifo.push(value);
            c.char_avail = true;
            if c.rx_int_enabled() {
                self.rr3 |= if ch == CH_A { RR3_A_RX } else { RR3_B_RX };
            }
        } else {
            maclog!(Cat::Scc, Trace, "tx byte {:02x} on channel {} dropped", value, ch);
        }
    }

    // Host side: queue an inbound SDLC frame. Bounded; overflow drops the
    // frame the way a saturated wire would.
    pub fn queue_frame(&mut self, ch: usize, frame: &[u8]) {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            maclog!(Cat::Scc, Warn, "inbound frame of {} bytes dropped", frame.len());
            return;
        }
        if self.channels[ch].frames.len() >= MAX_FRAMES {
            maclog!(Cat::Scc, Warn, "frame queue full, dropping");
            return;
        }
        self.channels[ch].frames.push(frame.to_vec());
        self.pump(ch);
    }

    fn pump(&mut self, ch: usize) {
        loop {
            let c = &mut self.channels[ch];
            if !c.hunt || !c.rx_enabled() || c.frames.is_empty() {
                return;
            }
            let frame = c.frames.remove(0);
            if c.addr_search() && frame[0] != 0xFF && frame[0] != c.wr[6] {
                maclog!(Cat::Scc, Trace, "frame for {:02x} filtered", frame[0]);
                continue;
            }
            c.rx_fifo = frame;
            c.char_avail = true;
            c.hunt = false;
            c.eof = false;
            if c.rx_int_enabled() {
                self.rr3 |= if ch == CH_A { RR3_A_RX } else { RR3_B_RX };
            }
            return;
        }
    }

    // DCD line changes arrive from the mouse (and, one day, a real modem).
    pub fn set_dcd(&mut self, ch: usize, level: bool) {
        if self.channels[ch].dcd == level {
            return;
        }
        self.channels[ch].dcd = level;
        if self.channels[ch].wr[15] & 0x08 != 0 && self.channels[ch].ext_int_enabled() {
            self.rr3 |= if ch == CH_A { RR3_A_EXT } else { RR3_B_EXT };
        }
    }

    pub fn dcd(&self, ch: usize) -> bool {
        self.channels[ch].dcd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wr(scc: &mut Scc, sched: &mut Scheduler, ch: usize, reg: u8, value: u8) {
        let ctl = if ch == CH_A { 0x2 } else { 0x0 };
        let mut first = reg & 0x07;
        if reg >= 8 {
            first |= 0x08;
        }
        scc.write(ctl, first, sched);
        scc.write(ctl, value, sched);
    }

    fn read_rr(scc: &mut Scc, sched: &mut Scheduler, ch: usize, reg: u8) -> u8 {
        let ctl = if ch == CH_A { 0x2 } else { 0x0 };
        let mut first = reg & 0x07;
        if reg >= 8 {
            first |= 0x08;
        }
        scc.write(ctl, first, sched);
        scc.read(ctl, sched)
    }

    fn enable_sdlc_rx(scc: &mut Scc, sched: &mut Scheduler) {
        write_wr(scc, sched, CH_B, 9, 0x08); // MIE
        write_wr(scc, sched, CH_B, 1, 0x18); // rx interrupts
        write_wr(scc, sched, CH_B, 3, 0x01); // rx enable -> hunt
    }

    #[test]
    fn frame_moves_to_fifo_when_hunting() {
        let mut sched = Scheduler::new();
        let mut scc = Scc::new();
        scc.queue_frame(CH_B, &[0x10, 0x20, 0x30]);
        // Not hunting yet: the frame waits outside.
        assert_eq!(read_rr(&mut scc, &mut sched, CH_B, 0) & 0x01, 0);
        enable_sdlc_rx(&mut scc, &mut sched);
        assert_ne!(read_rr(&mut scc, &mut sched, CH_B, 0) & 0x01, 0);
        assert!(scc.irq_asserted());
        assert_eq!(scc.read(0x4, &mut sched), 0x10);
        assert_eq!(scc.read(0x4, &mut sched), 0x20);
        assert_eq!(scc.read(0x4, &mut sched), 0x30);
        // EOF on the last byte, hunt re-entered
        assert_ne!(read_rr(&mut scc, &mut sched, CH_B, 1) & 0x80, 0);
        assert_ne!(read_rr(&mut scc, &mut sched, CH_B, 0) & 0x10, 0);
    }

    #[test]
    fn address_filter_drops_foreign_frames() {
        let mut sched = Scheduler::new();
        let mut scc = Scc::new();
        write_wr(&mut scc, &mut sched, CH_B, 6, 0x42);
        write_wr(&mut scc, &mut sched, CH_B, 9, 0x08);
        write_wr(&mut scc, &mut sched, CH_B, 1, 0x18);
        write_wr(&mut scc, &mut sched, CH_B, 3, 0x05); // rx enable + addr search
        scc.queue_frame(CH_B, &[0x99, 1, 2]);
        assert_eq!(read_rr(&mut scc, &mut sched, CH_B, 0) & 0x01, 0);
        scc.queue_frame(CH_B, &[0x42, 3, 4]);
        assert_ne!(read_rr(&mut scc, &mut sched, CH_B, 0) & 0x01, 0);
        assert_eq!(scc.read(0x4, &mut sched), 0x42);
        // broadcast always passes
        scc.read(0x4, &mut sched);
        scc.read(0x4, &mut sched);
        scc.queue_frame(CH_B, &[0xFF, 5]);
        assert_ne!(read_rr(&mut scc, &mut sched, CH_B, 0) & 0x01, 0);
    }

    #[test]
    fn rr2_is_verbatim_on_a_and_modified_on_b() {
        let mut sched = Scheduler::new();
        let mut scc = Scc::new();
        write_wr(&mut scc, &mut sched, CH_A, 2, 0x60);
        assert_eq!(read_rr(&mut scc, &mut sched, CH_A, 2), 0x60);
        // nothing pending: status 011
        assert_eq!(read_rr(&mut scc, &mut sched, CH_B, 2), 0x66);
        enable_sdlc_rx(&mut scc, &mut sched);
        scc.queue_frame(CH_B, &[1]);
        // ch B rx pending: status 010
        assert_eq!(read_rr(&mut scc, &mut sched, CH_B, 2), 0x64);
    }

    #[test]
    fn brg_zero_count_raises_ext_status() {
        let mut sched = Scheduler::new();
        let mut scc = Scc::new();
        write_wr(&mut scc, &mut sched, CH_B, 9, 0x08);
        write_wr(&mut scc, &mut sched, CH_B, 1, 0x01); // ext int enable
        write_wr(&mut scc, &mut sched, CH_B, 15, 0x02); // zero-count IE
        write_wr(&mut scc, &mut sched, CH_B, 12, 0x09);
        write_wr(&mut scc, &mut sched, CH_B, 13, 0x00);
        write_wr(&mut scc, &mut sched, CH_B, 14, 0x01); // BRG enable
        assert!(sched.is_scheduled(EventKind::SccBrg { ch: 1 }));
        scc.brg_zero_count(CH_B, &mut sched);
        assert!(scc.irq_asserted());
        assert_ne!(read_rr(&mut scc, &mut sched, CH_A, 3) & 0x01, 0);
        // still rescheduled
        assert!(sched.is_scheduled(EventKind::SccBrg { ch: 1 }));
    }

    #[test]
    fn loopback_routes_tx_to_rx() {
        let mut sched = Scheduler::new();
        let mut scc = Scc::new();
        write_wr(&mut scc, &mut sched, CH_A, 14, 0x10);
        scc.write(0x6, 0xA5, &mut sched);
        assert_eq!(scc.read(0x6, &mut sched), 0xA5);
    }

    #[test]
    fn dcd_sets_ext_pending_when_enabled() {
        let mut sched = Scheduler::new();
        let mut scc = Scc::new();
        write_wr(&mut scc, &mut sched, CH_A, 9, 0x08);
        write_wr(&mut scc, &mut sched, CH_A, 1, 0x01);
        write_wr(&mut scc, &mut sched, CH_A, 15, 0x08);
        scc.set_dcd(CH_A, true);
        assert!(scc.irq_asserted());
        assert_ne!(read_rr(&mut scc, &mut sched, CH_A, 3) & 0x08, 0);
    }

    #[test]
    fn frame_queue_is_bounded() {
        let mut scc = Scc::new();
        for i in 0..10 {
            scc.queue_frame(CH_B, &[i]);
        }
        assert_eq!(scc.channels[CH_B].frames.len(), 8);
        scc.queue_frame(CH_B, &vec![0; 2048]);
        assert_eq!(scc.channels[CH_B].frames.len(), 8);
    }
}
