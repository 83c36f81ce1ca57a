// Headless debug core: PC breakpoints, logpoints over address ranges, and
// bounded trace rings. While anything here is armed the scheduler clamps
// sprints to single instructions and calls back once per instruction, which
// is what makes per-PC logpoints possible at all. The interactive front end
// lives in the binary; this is just the machinery.

use crate::logging::{would_log, Cat};
use log::Level;
use std::collections::VecDeque;

const TRACE_CAP: usize = 256;
const LOG_TEXT_CAP: usize = 128;

#[derive(Debug, Clone)]
pub struct Logpoint {
    pub from: u32,
    pub to: u32,
    pub cat: Cat,
    pub level: Level,
    pub message: Option<String>,
    pub hits: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    Pc(u32),
    Log(usize),
}

pub struct Debugger {
    breakpoints: Vec<u32>,
    skip_pc: Option<u32>,
    logpoints: Vec<Logpoint>,
    tracing: bool,
    trace: VecDeque<TraceEntry>,
    log_texts: VecDeque<String>,
    log_seq: usize,
}

impl Debugger {
    pub fn new() -> Self {
        Debugger {
            breakpoints: Vec::new(),
            skip_pc: None,
            logpoints: Vec::new(),
            tracing: false,
            trace: VecDeque::with_capacity(TRACE_CAP),
            log_texts: VecDeque::with_capacity(LOG_TEXT_CAP),
            log_seq: 0,
        }
    }

    // The scheduler only pays the single-instruction cost while this is true.
    pub fn active(&self) -> bool {
        !self.breakpoints.is_empty() || !self.logpoints.is_empty() || self.tracing
    }

    pub fn add_breakpoint(&mut self, pc: u32) {
        if !self.breakpoints.contains(&pc) {
            self.breakpoints.push(pc);
        }
    }

    pub fn remove_breakpoint(&mut self, pc: u32) {
        self.breakpoints.retain(|&b| b != pc);
    }

    pub fn breakpoints(&self) -> &[u32] {
        &self.breakpoints
    }

    pub fn add_logpoint(&mut self, from: u32, to: u32, cat: Cat, level: Level, message: Option<String>) {
        self.logpoints.push(Logpoint { from, to, cat, level, message, hits: 0 });
    }

    pub fn logpoints(&self) -> &[Logpoint] {
        &self.logpoints
    }

    pub fn set_tracing(&mut self, on: bool) {
        self.tracing = on;
    }

    fn push_trace(&mut self, entry: TraceEntry) {
        if self.trace.len() == TRACE_CAP {
            self.trace.pop_front();
        }
        self.trace.push_back(entry);
    }

    fn push_log_text(&mut self, text: String) -> usize {
        if self.log_texts.len() == LOG_TEXT_CAP {
            self.log_texts.pop_front();
        }
        self.log_texts.push_back(text);
        self.log_seq += 1;
        self.log_seq - 1
    }

    // Called once per executed instruction while active. Returns true when a
    // breakpoint asks the sprint loop to stop; the hit PC is remembered so
    // the next run steps over it exactly once.
    pub fn break_and_trace(&mut self, pc: u32) -> bool {
        if self.tracing {
            self.push_trace(TraceEntry::Pc(pc));
        }
        for i in 0..self.logpoints.len() {
            let (hit, text) = {
                let lp = &mut self.logpoints[i];
                if pc < lp.from || pc > lp.to {
                    continue;
                }
                lp.hits += 1;
                if would_log(lp.cat, lp.level) {
                    let msg = match &lp.message {
                        Some(m) => format!("pc {:08x}: {} (hit {})", pc, m, lp.hits),
                        None => format!("pc {:08x} in {:08x}..{:08x} (hit {})", pc, lp.from, lp.to, lp.hits),
                    };
                    (true, msg)
                } else {
                    (false, String::new())
                }
            };
            if hit {
                let cat = self.logpoints[i].cat;
                let level = self.logpoints[i].level;
                log::log!(target: cat.name(), level, "{}", text);
                let index = self.push_log_text(text);
                self.push_trace(TraceEntry::Log(index));
            }
        }
        if self.breakpoints.contains(&pc) {
            if self.skip_pc.take() == Some(pc) {
                return false;
            }
            self.skip_pc = Some(pc);
            maclog!(Cat::Dbg, Info, "breakpoint at {:08x}", pc);
            return true;
        }
        // Execution moved elsewhere; the step-over credit expires.
        self.skip_pc = None;
        false
    }

    // Tail-to-head listing through a caller-supplied disassembler.
    pub fn show(&self, disasm: &dyn Fn(u32) -> String) -> Vec<String> {
        let base = self.log_seq - self.log_texts.len();
        self.trace
            .iter()
            .map(|entry| match entry {
                TraceEntry::Pc(pc) => format!("{:08x}  {}", pc, disasm(*pc)),
                TraceEntry::Log(index) => match index.checked_sub(base) {
                    Some(i) if i < self.log_texts.len() => format!("    | {}", self.log_texts[i]),
                    _ => "    | (log rotated out)".to_string(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_stops_then_skips_once() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(0x1000);
        assert!(!dbg.break_and_trace(0x0FFE));
        assert!(dbg.break_and_trace(0x1000));
        // The remembered PC passes once, then arms again.
        assert!(!dbg.break_and_trace(0x1000));
        assert!(dbg.break_and_trace(0x1000));
    }

    #[test]
    fn logpoints_count_hits() {
        let mut dbg = Debugger::new();
        dbg.add_logpoint(0x2000, 0x2FFF, Cat::Dbg, Level::Error, Some("hot loop".to_string()));
        for pc in (0x2000..0x2010).step_by(2) {
            dbg.break_and_trace(pc);
        }
        dbg.break_and_trace(0x4000);
        assert_eq!(dbg.logpoints()[0].hits, 8);
    }

    #[test]
    fn trace_ring_is_bounded_and_ordered() {
        let mut dbg = Debugger::new();
        dbg.set_tracing(true);
        for i in 0..300u32 {
            dbg.break_and_trace(i * 2);
        }
        let lines = dbg.show(&|pc| format!("dc.w ${:04x}", pc));
        assert_eq!(lines.len(), TRACE_CAP);
        assert!(lines[0].starts_with(&format!("{:08x}", (300 - TRACE_CAP as u32) * 2)));
        assert!(lines.last().unwrap().starts_with(&format!("{:08x}", 299 * 2)));
    }

    #[test]
    fn active_reflects_armed_tools() {
        let mut dbg = Debugger::new();
        assert!(!dbg.active());
        dbg.set_tracing(true);
        assert!(dbg.active());
        dbg.set_tracing(false);
        dbg.add_breakpoint(4);
        assert!(dbg.active());
        dbg.remove_breakpoint(4);
        assert!(!dbg.active());
    }

    #[test]
    fn log_entries_interleave_in_the_trace() {
        let mut dbg = Debugger::new();
        dbg.set_tracing(true);
        dbg.add_logpoint(0x100, 0x100, Cat::Dbg, Level::Error, None);
        dbg.break_and_trace(0x0FE);
        dbg.break_and_trace(0x100);
        let lines = dbg.show(&|_| String::new());
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("hit 1"));
    }
}
