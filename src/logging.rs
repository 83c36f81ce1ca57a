// Per-category log levels on top of the `log` facade. Every emulated chip logs
// into its own category so a single noisy device can be turned up without
// drowning the run in everything else. The level check is one relaxed atomic
// load, cheap enough to leave in the MMIO hot path.

use log::Level;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cat {
    Sched = 0,
    Mem = 1,
    Via = 2,
    Scc = 3,
    Iwm = 4,
    Swim = 5,
    Scsi = 6,
    Rtc = 7,
    Asc = 8,
    Adb = 9,
    Kbd = 10,
    Mouse = 11,
    Snd = 12,
    Ckpt = 13,
    Dbg = 14,
}

pub const NUM_CATS: usize = 15;

static LEVELS: [AtomicU8; NUM_CATS] = [
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
    AtomicU8::new(DEFAULT_LEVEL),
];

const DEFAULT_LEVEL: u8 = Level::Warn as usize as u8;

impl Cat {
    pub fn name(&self) -> &'static str {
        match *self {
            Cat::Sched => "sched",
            Cat::Mem => "mem",
            Cat::Via => "via",
            Cat::Scc => "scc",
            Cat::Iwm => "iwm",
            Cat::Swim => "swim",
            Cat::Scsi => "scsi",
            Cat::Rtc => "rtc",
            Cat::Asc => "asc",
            Cat::Adb => "adb",
            Cat::Kbd => "kbd",
            Cat::Mouse => "mouse",
            Cat::Snd => "snd",
            Cat::Ckpt => "ckpt",
            Cat::Dbg => "dbg",
        }
    }
    pub fn from_name(name: &str) -> Option<Cat> {
        Some(match name {
            "sched" => Cat::Sched,
            "mem" => Cat::Mem,
            "via" => Cat::Via,
            "scc" => Cat::Scc,
            "iwm" => Cat::Iwm,
            "swim" => Cat::Swim,
            "scsi" => Cat::Scsi,
            "rtc" => Cat::Rtc,
            "asc" => Cat::Asc,
            "adb" => Cat::Adb,
            "kbd" => Cat::Kbd,
            "mouse" => Cat::Mouse,
            "snd" => Cat::Snd,
            "ckpt" => Cat::Ckpt,
            "dbg" => Cat::Dbg,
            _ => return None,
        })
    }
}

pub fn set_level(cat: Cat, level: Level) {
    LEVELS[cat as usize].store(level as usize as u8, Ordering::Relaxed);
}

pub fn level(cat: Cat) -> Level {
    match LEVELS[cat as usize].load(Ordering::Relaxed) {
        1 => Level::Error,
        2 => Level::Warn,
        3 => Level::Info,
        4 => Level::Debug,
        _ => Level::Trace,
    }
}

pub fn would_log(cat: Cat, level: Level) -> bool {
    LEVELS[cat as usize].load(Ordering::Relaxed) >= level as usize as u8
}

// maclog!(Cat::Via, Debug, "T1 armed at {}", cycles)
#[macro_export]
macro_rules! maclog {
    ($cat:expr, $lvl:ident, $($arg:tt)+) => {
        if $crate::logging::would_log($cat, log::Level::$lvl) {
            log::log!(target: $cat.name(), log::Level::$lvl, $($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_levels_gate_formatting() {
        set_level(Cat::Via, Level::Warn);
        assert!(would_log(Cat::Via, Level::Error));
        assert!(would_log(Cat::Via, Level::Warn));
        assert!(!would_log(Cat::Via, Level::Debug));
        set_level(Cat::Via, Level::Trace);
        assert!(would_log(Cat::Via, Level::Trace));
        set_level(Cat::Via, Level::Warn);
    }

    #[test]
    fn names_round_trip() {
        for cat in [Cat::Sched, Cat::Iwm, Cat::Scsi, Cat::Ckpt].iter() {
            assert_eq!(Cat::from_name(cat.name()), Some(*cat));
        }
        assert_eq!(Cat::from_name("nonsense"), None);
    }
}
