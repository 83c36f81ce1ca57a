// The Mac Plus keyboard, a little microcontroller on a serial line the OS
// polls through the VIA shift register. Four commands matter: INQUIRY waits
// up to 250 ms for a key before answering "null", INSTANT answers at once,
// MODEL and TEST identify the hardware. Every reply is gated by the ~2.64 ms
// the real controller needs to clock a byte out. Arrow and keypad keys send a
// 0x79 prefix before the shared code; releases set bit 7; the host's
// auto-repeat is filtered with a pressed-key bitmap.

use crate::logging::Cat;
use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

pub const CMD_INQUIRY: u8 = 0x10;
pub const CMD_INSTANT: u8 = 0x14;
pub const CMD_MODEL: u8 = 0x16;
pub const CMD_TEST: u8 = 0x36;

pub const REPLY_NULL: u8 = 0x7B;
pub const REPLY_MODEL: u8 = 0x0B;
pub const REPLY_TEST_ACK: u8 = 0x7D;
pub const PREFIX_KEYPAD: u8 = 0x79;

const RESPONSE_DELAY_NS: u64 = 2_640_000;
const INQUIRY_TIMEOUT_NS: u64 = 250_000_000;
const QUEUE_CAP: usize = 8;

// Host-neutral key identifiers; the front end maps its own events onto these.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Key {
    A, B, C, D, E, F, G, H, I, J, K, L, M,
    N, O, P, Q, R, S, T, U, V, W, X, Y, Z,
    Num0, Num1, Num2, Num3, Num4, Num5, Num6, Num7, Num8, Num9,
    Minus, Equal, LeftBracket, RightBracket, Backslash, Semicolon,
    Quote, Comma, Period, Slash, Backquote,
    Return, Tab, Space, Backspace, Enter,
    Shift, CapsLock, Option, Command,
    Left, Right, Down, Up,
    Kp0, Kp1, Kp2, Kp3, Kp4, Kp5, Kp6, Kp7, Kp8, Kp9,
    KpDot, KpMinus, KpPlus, KpMultiply, KpDivide, KpClear,
}

struct Translation {
    scan: u8,
    prefixed: bool,
}

fn translate(key: Key) -> Translation {
    use Key::*;
    let (scan, prefixed) = match key {
        A => (0x00, false), S => (0x01, false), D => (0x02, false), F => (0x03, false),
        H => (0x04, false), G => (0x05, false), Z => (0x06, false), X => (0x07, false),
        C => (0x08, false), V => (0x09, false), B => (0x0B, false), Q => (0x0C, false),
        W => (0x0D, false), E => (0x0E, false), R => (0x0F, false), Y => (0x10, false),
        T => (0x11, false),
        Num1 => (0x12, false), Num2 => (0x13, false), Num3 => (0x14, false),
        Num4 => (0x15, false), Num6 => (0x16, false), Num5 => (0x17, false),
        Equal => (0x18, false), Num9 => (0x19, false), Num7 => (0x1A, false),
        Minus => (0x1B, false), Num8 => (0x1C, false), Num0 => (0x1D, false),
        RightBracket => (0x1E, false), O => (0x1F, false), U => (0x20, false),
        LeftBracket => (0x21, false), I => (0x22, false), P => (0x23, false),
        Return => (0x24, false), L => (0x25, false), J => (0x26, false),
        Quote => (0x27, false), K => (0x28, false), Semicolon => (0x29, false),
        Backslash => (0x2A, false), Comma => (0x2B, false), Slash => (0x2C, false),
        N => (0x2D, false), M => (0x2E, false), Period => (0x2F, false),
        Tab => (0x30, false), Space => (0x31, false), Backquote => (0x32, false),
        Backspace => (0x33, false),
        Command => (0x37, false), Shift => (0x38, false), CapsLock => (0x39, false),
        Option => (0x3A, false),
        // Keypad and arrows share the prefixed code space.
        Enter => (0x0C, true),
        Left => (0x0D, true), Right => (0x05, true), Down => (0x11, true), Up => (0x1B, true),
        KpDot => (0x01, true), KpClear => (0x07, true),
        KpMultiply => (0x02, true), KpPlus => (0x03, true),
        KpDivide => (0x0E, true), KpMinus => (0x0F, true),
        Kp0 => (0x12, true), Kp1 => (0x13, true), Kp2 => (0x14, true), Kp3 => (0x15, true),
        Kp4 => (0x16, true), Kp5 => (0x17, true), Kp6 => (0x18, true), Kp7 => (0x19, true),
        Kp8 => (0x1A, true), Kp9 => (0x1C, true),
    };
    Translation { scan, prefixed }
}

// ADB virtual code for the same key, used by the SE/30 input path.
pub fn adb_code(key: Key) -> u8 {
    let t = translate(key);
    t.scan | if t.prefixed { 0x40 } else { 0 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlusKeyboard {
    queue: Vec<u8>,
    pressed: u128,
    inquiry_waiting: bool,
}

impl PlusKeyboard {
    pub fn new() -> Self {
        PlusKeyboard { queue: Vec::new(), pressed: 0, inquiry_waiting: false }
    }

    // A command byte arrived over the shift register.
    pub fn command(&mut self, cmd: u8, sched: &mut Scheduler) {
        match cmd {
            CMD_INQUIRY => {
                if let Some(byte) = self.pop_queued() {
                    self.schedule_reply(byte, sched);
                } else {
                    self.inquiry_waiting = true;
                    sched.remove(EventKind::KbdInquiryTimeout);
                    sched.schedule_ns(EventKind::KbdInquiryTimeout, 0, INQUIRY_TIMEOUT_NS);
                }
            }
            CMD_INSTANT => {
                let byte = self.pop_queued().unwrap_or(REPLY_NULL);
                self.schedule_reply(byte, sched);
            }
            CMD_MODEL => {
                self.queue.clear();
                self.inquiry_waiting = false;
                sched.remove(EventKind::KbdInquiryTimeout);
                self.schedule_reply(REPLY_MODEL, sched);
            }
            CMD_TEST => self.schedule_reply(REPLY_TEST_ACK, sched),
            _ => {
                maclog!(Cat::Kbd, Debug, "unknown keyboard command {:02x}", cmd);
                self.schedule_reply(REPLY_NULL, sched);
            }
        }
    }

    // The INQUIRY window closed without a key.
    pub fn inquiry_timeout(&mut self, sched: &mut Scheduler) {
        if self.inquiry_waiting {
            self.inquiry_waiting = false;
            self.schedule_reply(REPLY_NULL, sched);
        }
    }

    fn schedule_reply(&self, byte: u8, sched: &mut Scheduler) {
        sched.schedule_ns(EventKind::KbdReply, byte as u64, RESPONSE_DELAY_NS);
    }

    fn pop_queued(&mut self) -> Option<u8> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    fn enqueue(&mut self, byte: u8, sched: &mut Scheduler) {
        if self.queue.len() >= QUEUE_CAP {
            maclog!(Cat::Kbd, Warn, "key queue full, dropping {:02x}", byte);
            return;
        }
        self.queue.push(byte);
        if self.inquiry_waiting {
            // A pending INQUIRY answers as soon as a key arrives.
            self.inquiry_waiting = false;
            sched.remove(EventKind::KbdInquiryTimeout);
            let byte = self.pop_queued().unwrap();
            self.schedule_reply(byte, sched);
        }
    }

    pub fn key_event(&mut self, key: Key, down: bool, sched: &mut Scheduler) {
        let t = translate(key);
        let bit_index = (t.scan as u32) | if t.prefixed { 0x40 } else { 0 };
        let bit = 1u128 << bit_index;
        if down {
            if self.pressed & bit != 0 {
                return; // host auto-repeat
            }
            self.pressed |= bit;
        } else {
            self.pressed &= !bit;
        }
        let mut code = (t.scan << 1) | 1;
        if !down {
            code |= 0x80;
        }
        if t.prefixed {
            self.enqueue(PREFIX_KEYPAD, sched);
        }
        self.enqueue(code, sched);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
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

    fn replies(kbd: &mut PlusKeyboard, sched: &mut Scheduler, cycles: u64) -> Vec<u8> {
        let mut out = Vec::new();
        for ev in advance(sched, cycles) {
            match ev.kind {
                EventKind::KbdReply => out.push(ev.data as u8),
                EventKind::KbdInquiryTimeout => kbd.inquiry_timeout(sched),
                _ => {}
            }
        }
        out
    }

    #[test]
    fn instant_answers_null_when_idle() {
        let mut s = Scheduler::new();
        let mut kbd = PlusKeyboard::new();
        kbd.command(CMD_INSTANT, &mut s);
        let r = replies(&mut kbd, &mut s, 50_000);
        assert_eq!(r, vec![REPLY_NULL]);
    }

    #[test]
    fn inquiry_waits_for_a_key() {
        let mut s = Scheduler::new();
        let mut kbd = PlusKeyboard::new();
        kbd.command(CMD_INQUIRY, &mut s);
        assert!(replies(&mut kbd, &mut s, 100_000).is_empty());
        kbd.key_event(Key::A, true, &mut s);
        let r = replies(&mut kbd, &mut s, 100_000);
        assert_eq!(r, vec![0x01]); // scan 0x00 -> wire 0x01
    }

    #[test]
    fn inquiry_times_out_to_null() {
        let mut s = Scheduler::new();
        let mut kbd = PlusKeyboard::new();
        kbd.command(CMD_INQUIRY, &mut s);
        // 250 ms at 7.8336 MHz is just under 2M cycles.
        let r = replies(&mut kbd, &mut s, 3_000_000);
        assert_eq!(r, vec![REPLY_NULL]);
    }

    #[test]
    fn model_resets_the_queue() {
        let mut s = Scheduler::new();
        let mut kbd = PlusKeyboard::new();
        kbd.key_event(Key::B, true, &mut s);
        kbd.command(CMD_MODEL, &mut s);
        assert_eq!(kbd.queue_len(), 0);
        let r = replies(&mut kbd, &mut s, 50_000);
        assert_eq!(r, vec![REPLY_MODEL]);
    }

    #[test]
    fn keypad_keys_carry_a_prefix() {
        let mut s = Scheduler::new();
        let mut kbd = PlusKeyboard::new();
        kbd.key_event(Key::Left, true, &mut s);
        kbd.command(CMD_INSTANT, &mut s);
        kbd.command(CMD_INSTANT, &mut s);
        let r = replies(&mut kbd, &mut s, 100_000);
        assert_eq!(r, vec![PREFIX_KEYPAD, (0x0D << 1) | 1]);
    }

    #[test]
    fn key_up_sets_bit_7_and_repeat_is_suppressed() {
        let mut s = Scheduler::new();
        let mut kbd = PlusKeyboard::new();
        kbd.key_event(Key::Q, true, &mut s);
        kbd.key_event(Key::Q, true, &mut s); // host auto-repeat
        kbd.key_event(Key::Q, false, &mut s);
        assert_eq!(kbd.queue_len(), 2);
        kbd.command(CMD_INSTANT, &mut s);
        kbd.command(CMD_INSTANT, &mut s);
        let r = replies(&mut kbd, &mut s, 100_000);
        let down = (0x0C << 1) | 1;
        assert_eq!(r, vec![down, down | 0x80]);
    }
}
