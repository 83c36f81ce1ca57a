// Checkpoints: the whole machine to bytes and back. Every device keeps its
// state in a serializable struct with the wiring (backing files, host
// estimators) outside, so a snapshot is just those structs plus RAM, the CPU
// registers, and the scheduler's queue saved as name-keyed event records. A
// build-id header refuses restores across builds. The sequence-file store
// implements the pending/checkpoint/complete dance so a crash mid-write can
// never leave a half snapshot looking valid.

use crate::adb::AdbTransceiver;
use crate::asc::Asc;
use crate::cpu::Cpu;
use crate::error::Error;
use crate::keyboard::PlusKeyboard;
use crate::logging::Cat;
use crate::mac::{MacModel, Machine};
use crate::mouse::QuadMouse;
use crate::rtc::Rtc;
use crate::scc::Scc;
use crate::scheduler::SchedulerState;
use crate::scsi::Scsi;
use crate::sound::PlusSound;
use crate::swim::Swim;
use crate::via::Via;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub fn build_id() -> String {
    format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedCpu {
    pub pc: u32,
    pub regs: Vec<u32>,
}

// Serialization side borrows the live devices; the owned mirror below is the
// deserialization target. Field order must match exactly.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    build: &'a str,
    model: MacModel,
    overlay: bool,
    video_alt: bool,
    ram: &'a [u8],
    cpu: SavedCpu,
    scheduler: SchedulerState,
    via1: &'a Via,
    via2: &'a Via,
    scc: &'a Scc,
    swim: &'a Swim,
    scsi: &'a Scsi,
    rtc: &'a Rtc,
    asc: &'a Asc,
    adb: &'a AdbTransceiver,
    kbd: &'a PlusKeyboard,
    mouse: &'a QuadMouse,
    sound: &'a PlusSound,
}

#[derive(Deserialize)]
pub struct Snapshot {
    pub build: String,
    pub model: MacModel,
    pub overlay: bool,
    pub video_alt: bool,
    pub ram: Vec<u8>,
    pub cpu: SavedCpu,
    pub scheduler: SchedulerState,
    pub via1: Via,
    pub via2: Via,
    pub scc: Scc,
    pub swim: Swim,
    pub scsi: Scsi,
    pub rtc: Rtc,
    pub asc: Asc,
    pub adb: AdbTransceiver,
    pub kbd: PlusKeyboard,
    pub mouse: QuadMouse,
    pub sound: PlusSound,
}

pub fn save(machine: &Machine) -> Result<Vec<u8>, Error> {
    let b = &machine.bus;
    let build = build_id();
    let snap = SnapshotRef {
        build: &build,
        model: b.model,
        overlay: b.overlay,
        video_alt: b.video_alt,
        ram: b.map.ram(),
        cpu: SavedCpu {
            pc: machine.cpu.pc(),
            regs: (0..16).map(|i| machine.cpu.reg(i)).collect(),
        },
        scheduler: b.scheduler.save_state(),
        via1: &b.via1,
        via2: &b.via2,
        scc: &b.scc,
        swim: &b.swim,
        scsi: &b.scsi,
        rtc: &b.rtc,
        asc: &b.asc,
        adb: &b.adb,
        kbd: &b.kbd,
        mouse: &b.mouse,
        sound: &b.sound,
    };
    Ok(bincode::serialize(&snap)?)
}

pub fn parse(bytes: &[u8]) -> Result<Snapshot, Error> {
    let snap: Snapshot = bincode::deserialize(bytes)?;
    let expected = build_id();
    if snap.build != expected {
        return Err(Error::BuildMismatch { expected, found: snap.build });
    }
    Ok(snap)
}

// Rebuild a machine around a snapshot. The caller supplies the same ROM and
// a CPU engine; disk images are re-attached afterwards by filename.
pub fn restore(bytes: &[u8], rom: Vec<u8>, cpu: Box<dyn Cpu>) -> Result<Machine, Error> {
    let snap = parse(bytes)?;
    let mut machine = Machine::with_cpu(snap.model, rom, cpu)?;
    {
        let bus = &mut machine.bus;
        if snap.ram.len() != bus.map.ram_size() {
            return Err(Error::BadRecord {
                record: "ram",
                reason: format!("{} bytes, expected {}", snap.ram.len(), bus.map.ram_size()),
            });
        }
        bus.map.ram_mut().copy_from_slice(&snap.ram);
        bus.scheduler.restore(&snap.scheduler)?;
        bus.via1 = snap.via1;
        bus.via2 = snap.via2;
        bus.scc = snap.scc;
        bus.swim = snap.swim;
        bus.scsi = snap.scsi;
        bus.rtc = snap.rtc;
        bus.asc = snap.asc;
        bus.adb = snap.adb;
        bus.kbd = snap.kbd;
        bus.mouse = snap.mouse;
        bus.sound = snap.sound;
        bus.video_alt = snap.video_alt;
        bus.set_overlay_restored(snap.overlay);
    }
    if snap.cpu.regs.len() != 16 {
        return Err(Error::BadRecord {
            record: "cpu",
            reason: format!("{} registers", snap.cpu.regs.len()),
        });
    }
    machine.cpu.set_pc(snap.cpu.pc);
    for (i, &r) in snap.cpu.regs.iter().enumerate() {
        machine.cpu.set_reg(i, r);
    }
    let level = machine.bus.irq_level();
    machine.cpu.set_irq_level(level);
    maclog!(Cat::Ckpt, Info, "restored {} at cycle {}", snap.model.name(), machine.bus.scheduler.cycles());
    Ok(machine)
}

// On-disk store: NNNNNNN.pending while writing, renamed to .checkpoint, then
// an empty .complete marker seals it. Only sealed checkpoints are load
// candidates; the highest sequence wins and older records are collected.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        Ok(CheckpointStore { dir: dir.to_path_buf() })
    }

    fn path(&self, seq: u64, ext: &str) -> PathBuf {
        self.dir.join(format!("{:07}.{}", seq, ext))
    }

    pub fn save(&self, seq: u64, bytes: &[u8]) -> Result<PathBuf, Error> {
        let pending = self.path(seq, "pending");
        fs::write(&pending, bytes)?;
        let sealed = self.path(seq, "checkpoint");
        fs::rename(&pending, &sealed)?;
        fs::write(self.path(seq, "complete"), b"")?;
        self.collect_older(seq);
        maclog!(Cat::Ckpt, Info, "checkpoint {} written, {} bytes", seq, bytes.len());
        Ok(sealed)
    }

    fn collect_older(&self, keep: u64) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if let Some((seq, _)) = parse_name(&entry.file_name().to_string_lossy()) {
                if seq < keep {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    // The newest sequence whose .checkpoint has a matching .complete marker.
    pub fn latest(&self) -> Option<(u64, PathBuf)> {
        let entries = fs::read_dir(&self.dir).ok()?;
        let mut best: Option<u64> = None;
        for entry in entries.flatten() {
            if let Some((seq, ext)) = parse_name(&entry.file_name().to_string_lossy()) {
                if ext == "checkpoint" && self.path(seq, "complete").exists() {
                    best = Some(best.map_or(seq, |b: u64| b.max(seq)));
                }
            }
        }
        best.map(|seq| (seq, self.path(seq, "checkpoint")))
    }

    pub fn load_latest(&self) -> Result<Option<(u64, Vec<u8>)>, Error> {
        match self.latest() {
            Some((seq, path)) => Ok(Some((seq, fs::read(path)?))),
            None => Ok(None),
        }
    }
}

fn parse_name(name: &str) -> Option<(u64, &str)> {
    let dot = name.find('.')?;
    let seq = name[..dot].parse().ok()?;
    Some((seq, &name[dot + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::FreeRunCpu;

    fn rom() -> Vec<u8> {
        vec![0xAB; 0x20000]
    }

    fn machine() -> Machine {
        Machine::new(MacModel::Plus, rom()).unwrap()
    }

    #[test]
    fn snapshot_round_trip_is_byte_stable() {
        let mut m = machine();
        m.run(10_000);
        let bytes = save(&m).unwrap();
        let r = restore(&bytes, rom(), Box::new(FreeRunCpu::new(0))).unwrap();
        assert_eq!(r.bus.scheduler.cycles(), m.bus.scheduler.cycles());
        let again = save(&r).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn restore_rejects_foreign_builds() {
        let m = machine();
        let mut bytes = save(&m).unwrap();
        // The build string sits early in the stream; corrupt it.
        bytes[9] ^= 0xFF;
        match restore(&bytes, rom(), Box::new(FreeRunCpu::new(0))) {
            Err(Error::BuildMismatch { .. }) | Err(Error::Encoding(_)) => {}
            other => panic!("expected refusal, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn restore_carries_cpu_and_overlay() {
        let mut m = machine();
        m.cpu.set_pc(0x40_1234);
        m.cpu.set_reg(3, 0xCAFE);
        // drop the overlay
        m.bus.write(0xE80000 + (3 << 9), crate::memory::Width::Byte, 0xFF);
        m.bus.write(0xE80000 + (1 << 9), crate::memory::Width::Byte, 0x00);
        let bytes = save(&m).unwrap();
        let r = restore(&bytes, rom(), Box::new(FreeRunCpu::new(0))).unwrap();
        assert_eq!(r.cpu.pc(), 0x40_1234);
        assert_eq!(r.cpu.reg(3), 0xCAFE);
        assert!(!r.bus.overlay);
    }

    #[test]
    fn store_seals_and_collects() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.save(1, b"one").unwrap();
        store.save(2, b"two").unwrap();
        let (seq, bytes) = store.load_latest().unwrap().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(bytes, b"two");
        // Older records were collected.
        assert!(!dir.path().join("0000001.checkpoint").exists());
    }

    #[test]
    fn unsealed_checkpoints_are_not_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.save(1, b"good").unwrap();
        // A later write that never completed.
        fs::write(dir.path().join("0000005.checkpoint"), b"torn").unwrap();
        let (seq, bytes) = store.load_latest().unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(bytes, b"good");
    }
}
