// Real-time clock and parameter RAM behind the three-wire serial protocol on
// VIA port B. Commands are eight bits: bit 7 read/write, bits 6:4 a register
// class, bits 3:2 a sub-index, bits 1:0 always 01. Extended commands (bits
// 6:3 = 0111) carry a second byte forming an 8-bit PRAM address. The chip
// samples the data line on rising clock edges and shifts replies out over
// eight falling edges. A 1 Hz scheduler event advances the seconds counter
// and pulses the one-second line.

use crate::logging::Cat;
use crate::scheduler::{EventKind, Scheduler, CLOCK_HZ};
use serde::{Deserialize, Serialize};

// Mac epoch is 1 Jan 1904; Unix seconds plus this constant.
pub const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

const PRAM_SIZE: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Phase {
    Command,
    ExtendedAddress,
    WriteData,
    ReadData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rtc {
    seconds: u32,
    pram: Vec<u8>,
    write_protect: bool,
    enabled: bool,
    clock: bool,
    data_in: bool,
    phase: Phase,
    shift_in: u8,
    bits_in: u8,
    shift_out: u8,
    bits_out: u8,
    cmd: u8,
    cmd2: u8,
    one_sec_high: bool,
}

impl Rtc {
    pub fn new() -> Self {
        let unix = chrono::Utc::now().timestamp();
        Rtc::with_seconds((unix + MAC_EPOCH_OFFSET) as u32)
    }

    pub fn with_seconds(seconds: u32) -> Self {
        Rtc {
            seconds,
            pram: vec![0; PRAM_SIZE],
            write_protect: false,
            enabled: false,
            clock: false,
            data_in: true,
            phase: Phase::Command,
            shift_in: 0,
            bits_in: 0,
            shift_out: 0,
            bits_out: 0,
            cmd: 0,
            cmd2: 0,
            one_sec_high: false,
        }
    }

    pub fn start(&self, sched: &mut Scheduler) {
        if !sched.is_scheduled(EventKind::RtcTick) {
            sched.schedule_cycles(EventKind::RtcTick, 0, CLOCK_HZ);
        }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn set_seconds(&mut self, seconds: u32) {
        self.seconds = seconds;
    }

    pub fn pram(&self, addr: u8) -> u8 {
        self.pram[addr as usize]
    }

    // One-second tick; reschedules itself. Returns the line pulse for the
    // bus to feed into the VIA.
    pub fn tick(&mut self, sched: &mut Scheduler) -> bool {
        self.seconds = self.seconds.wrapping_add(1);
        sched.schedule_cycles(EventKind::RtcTick, 0, CLOCK_HZ);
        self.one_sec_high = !self.one_sec_high;
        true
    }

    pub fn data_line(&self) -> bool {
        if self.phase == Phase::ReadData {
            self.shift_out & 0x80 != 0
        } else {
            true
        }
    }

    // Serial line update from the VIA port. `enable` is the asserted sense;
    // deassertion resets the transaction.
    pub fn set_lines(&mut self, clock: bool, data: bool, enable: bool) {
        if !enable {
            if self.enabled {
                self.phase = Phase::Command;
                self.bits_in = 0;
                self.bits_out = 0;
            }
            self.enabled = false;
            self.clock = clock;
            self.data_in = data;
            return;
        }
        self.enabled = true;
        self.data_in = data;
        let rising = clock && !self.clock;
        let falling = !clock && self.clock;
        self.clock = clock;
        if rising && self.phase != Phase::ReadData {
            self.shift_in = (self.shift_in << 1) | self.data_in as u8;
            self.bits_in += 1;
            if self.bits_in == 8 {
                self.bits_in = 0;
                let byte = self.shift_in;
                self.shift_in = 0;
                self.byte_received(byte);
            }
        } else if falling && self.phase == Phase::ReadData {
            self.shift_out <<= 1;
            self.bits_out += 1;
            if self.bits_out == 8 {
                self.bits_out = 0;
                self.phase = Phase::Command;
            }
        }
    }

    fn byte_received(&mut self, byte: u8) {
        match self.phase {
            Phase::Command => {
                self.cmd = byte;
                if (byte >> 3) & 0x0F == 0b0111 {
                    self.phase = Phase::ExtendedAddress;
                } else if byte & 0x80 != 0 {
                    self.shift_out = self.reg_read();
                    self.bits_out = 0;
                    self.phase = Phase::ReadData;
                } else {
                    self.phase = Phase::WriteData;
                }
            }
            Phase::ExtendedAddress => {
                self.cmd2 = byte;
                let addr = self.extended_addr();
                if self.cmd & 0x80 != 0 {
                    self.shift_out = self.pram[addr as usize];
                    self.bits_out = 0;
                    self.phase = Phase::ReadData;
                } else {
                    self.phase = Phase::WriteData;
                }
            }
            Phase::WriteData => {
                self.reg_write(byte);
                self.phase = Phase::Command;
            }
            Phase::ReadData => unreachable!("no input while shifting out"),
        }
    }

    fn extended_addr(&self) -> u8 {
        ((self.cmd & 0x07) << 5) | ((self.cmd2 >> 2) & 0x1F)
    }

    fn reg_read(&self) -> u8 {
        let cmd = self.cmd;
        let sub = ((cmd >> 2) & 0x03) as usize;
        match (cmd >> 4) & 0x07 {
            0b000 | 0b001 => (self.seconds >> (8 * sub)) as u8,
            0b010 => self.pram[0x10 + sub],
            0b011 => 0xFF,
            _ => self.pram[((cmd >> 2) & 0x0F) as usize],
        }
    }

    fn reg_write(&mut self, value: u8) {
        let cmd = self.cmd;
        let extended = (cmd >> 3) & 0x0F == 0b0111;
        let sub = ((cmd >> 2) & 0x03) as usize;
        let is_wp = !extended && (cmd >> 4) & 0x07 == 0b011 && sub == 1;
        if is_wp {
            self.write_protect = value & 0x80 != 0;
            maclog!(Cat::Rtc, Debug, "write protect {}", self.write_protect);
            return;
        }
        if self.write_protect {
            maclog!(Cat::Rtc, Debug, "write {:02x} dropped, protected", cmd);
            return;
        }
        if extended {
            let addr = self.extended_addr();
            self.pram[addr as usize] = value;
            return;
        }
        match (cmd >> 4) & 0x07 {
            0b000 | 0b001 => {
                let shift = 8 * sub;
                self.seconds = (self.seconds & !(0xFF << shift)) | ((value as u32) << shift);
            }
            0b010 => self.pram[0x10 + sub] = value,
            0b011 => {} // test register, ignored
            _ => self.pram[((cmd >> 2) & 0x0F) as usize] = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_byte(rtc: &mut Rtc, byte: u8) {
        for i in (0..8).rev() {
            let bit = byte & (1 << i) != 0;
            rtc.set_lines(false, bit, true);
            rtc.set_lines(true, bit, true);
        }
    }

    fn recv_byte(rtc: &mut Rtc) -> u8 {
        let mut value = 0u8;
        for _ in 0..8 {
            rtc.set_lines(true, true, true);
            value = (value << 1) | rtc.data_line() as u8;
            rtc.set_lines(false, true, true);
        }
        value
    }

    fn finish(rtc: &mut Rtc) {
        rtc.set_lines(false, true, false);
    }

    // Command bytes: bits 1:0 are always 01.
    fn seconds_read_cmd(i: u8) -> u8 {
        0x80 | (i << 2) | 0x01
    }
    fn seconds_write_cmd(i: u8) -> u8 {
        (i << 2) | 0x01
    }

    #[test]
    fn seconds_round_trip_through_the_wire() {
        let mut rtc = Rtc::with_seconds(0);
        for (i, byte) in [0x78u8, 0x56, 0x34, 0x12].iter().enumerate() {
            send_byte(&mut rtc, seconds_write_cmd(i as u8));
            send_byte(&mut rtc, *byte);
            finish(&mut rtc);
        }
        assert_eq!(rtc.seconds(), 0x12345678);
        for (i, byte) in [0x78u8, 0x56, 0x34, 0x12].iter().enumerate() {
            send_byte(&mut rtc, seconds_read_cmd(i as u8));
            assert_eq!(recv_byte(&mut rtc), *byte);
            finish(&mut rtc);
        }
    }

    #[test]
    fn low_pram_addressing() {
        let mut rtc = Rtc::with_seconds(0);
        // PRAM 0x07: cmd %0_1_0111_01
        let cmd = 0x40 | (0x07 << 2) | 0x01;
        send_byte(&mut rtc, cmd);
        send_byte(&mut rtc, 0xA7);
        finish(&mut rtc);
        assert_eq!(rtc.pram(0x07), 0xA7);
        send_byte(&mut rtc, 0x80 | cmd);
        assert_eq!(recv_byte(&mut rtc), 0xA7);
    }

    #[test]
    fn mid_pram_addressing() {
        let mut rtc = Rtc::with_seconds(0);
        // PRAM 0x12: class 010, sub 2
        let cmd = (0b010 << 4) | (2 << 2) | 0x01;
        send_byte(&mut rtc, cmd);
        send_byte(&mut rtc, 0x12);
        finish(&mut rtc);
        assert_eq!(rtc.pram(0x12), 0x12);
    }

    #[test]
    fn extended_pram_addressing() {
        let mut rtc = Rtc::with_seconds(0);
        // Address 0xB4 = 101 10100: cmd1 %0_0111_101, cmd2 %0_10100_00
        let cmd1 = 0x38 | 0b101;
        let cmd2 = 0b10100 << 2;
        send_byte(&mut rtc, cmd1);
        send_byte(&mut rtc, cmd2);
        send_byte(&mut rtc, 0xC3);
        finish(&mut rtc);
        assert_eq!(rtc.pram(0xB4), 0xC3);
        send_byte(&mut rtc, 0x80 | cmd1);
        send_byte(&mut rtc, cmd2);
        assert_eq!(recv_byte(&mut rtc), 0xC3);
    }

    #[test]
    fn write_protect_latch() {
        let mut rtc = Rtc::with_seconds(0);
        let wp_cmd = (0b011 << 4) | (1 << 2) | 0x01; // 0x35
        send_byte(&mut rtc, wp_cmd);
        send_byte(&mut rtc, 0x80);
        finish(&mut rtc);
        // seconds writes now dropped
        send_byte(&mut rtc, seconds_write_cmd(0));
        send_byte(&mut rtc, 0xEE);
        finish(&mut rtc);
        assert_eq!(rtc.seconds(), 0);
        // clearing the latch goes through 0x35 itself
        send_byte(&mut rtc, wp_cmd);
        send_byte(&mut rtc, 0x00);
        finish(&mut rtc);
        send_byte(&mut rtc, seconds_write_cmd(0));
        send_byte(&mut rtc, 0xEE);
        finish(&mut rtc);
        assert_eq!(rtc.seconds(), 0xEE);
    }

    #[test]
    fn ticker_reschedules_itself() {
        let mut sched = Scheduler::new();
        let mut rtc = Rtc::with_seconds(100);
        rtc.start(&mut sched);
        assert!(sched.is_scheduled(EventKind::RtcTick));
        rtc.tick(&mut sched);
        assert_eq!(rtc.seconds(), 101);
        assert!(sched.is_scheduled(EventKind::RtcTick));
    }
}
