// IWM floppy controller and the Sony drives behind it. Every MMIO access
// toggles one of eight control lines picked by address bits 12:9 (even
// sub-address clears, odd sets); what a read returns then depends on Q6/Q7.
// Drive commands go through LSTRB with CA2/CA1/CA0/SEL encoding the
// operation, drive status comes back one bit at a time through the SENSE
// multiplexer on the same four lines. Tracks are GCR-encoded lazily on first
// access and decoded back into the image only when modified.

use crate::disk::{floppy_kind, DiskImage, FloppyKind};
use crate::error::Error;
use crate::gcr;
use crate::logging::Cat;
use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Control lines, address bits 12:10 pick the line, bit 9 the level.
const LINE_CA0: usize = 0;
const LINE_CA1: usize = 1;
const LINE_CA2: usize = 2;
const LINE_LSTRB: usize = 3;
const LINE_ENABLE: usize = 4;
const LINE_SELECT: usize = 5;
const LINE_Q6: usize = 6;
const LINE_Q7: usize = 7;

// LSTRB command codes, (CA2 CA1 CA0 SEL).
const CMD_TRACK_UP: u8 = 0x0;
const CMD_TRACK_DOWN: u8 = 0x8;
const CMD_TRACK_STEP: u8 = 0x2;
const CMD_MOTOR_ON: u8 = 0x4;
const CMD_MOTOR_OFF: u8 = 0xC;
const CMD_EJECT: u8 = 0x7;

// SENSE codes, (CA2 CA1 CA0 SEL).
const SENSE_DIRTN: u8 = 0x0;
const SENSE_CSTIN: u8 = 0x1;
const SENSE_STEP: u8 = 0x2;
const SENSE_WRTPRT: u8 = 0x3;
const SENSE_MOTORON: u8 = 0x4;
const SENSE_TK0: u8 = 0x5;
const SENSE_SWITCHED: u8 = 0x6;
const SENSE_TACH: u8 = 0x7;
const SENSE_RDDATA0: u8 = 0x8;
const SENSE_RDDATA1: u8 = 0x9;
const SENSE_SUPERDRIVE: u8 = 0xA;
const SENSE_DRVIN_HD: u8 = 0xB;
const SENSE_SIDES: u8 = 0xC;
const SENSE_READY: u8 = 0xD;
const SENSE_INSTALLED: u8 = 0xE;
const SENSE_NEWINTF: u8 = 0xF;

const MAX_TRACK: u8 = 79;
const SPINUP_NS: u64 = 400_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackBuf {
    pub bytes: Vec<u8>,
    pub modified: bool,
}

// An inserted disk. The image bytes and the backing file are wiring, rebuilt
// on restore by re-attaching an image with the same filename; the GCR track
// cache is state and travels in checkpoints.
#[derive(Serialize, Deserialize)]
pub struct Floppy {
    pub filename: String,
    pub kind: FloppyKind,
    pub writable: bool,
    tracks: BTreeMap<(u8, u8), TrackBuf>,
    #[serde(skip)]
    data: Vec<u8>,
    #[serde(skip)]
    backing: Option<Box<dyn DiskImage>>,
}

impl Floppy {
    fn from_image(image: Box<dyn DiskImage>) -> Result<Self, Error> {
        let kind = floppy_kind(image.as_ref())?;
        let mut data = vec![0; image.size()];
        image.read(0, &mut data);
        Ok(Floppy {
            filename: image.filename().to_string(),
            kind,
            writable: image.writable(),
            tracks: BTreeMap::new(),
            data,
            backing: Some(image),
        })
    }

    fn track_buf_mut(&mut self, track: u8, side: u8) -> &mut TrackBuf {
        let sides = self.kind.sides();
        let key = (track, side);
        if !self.tracks.contains_key(&key) {
            let spt = gcr::sectors_in_track(track as usize);
            let off = gcr::track_image_offset(track as usize, side as usize, sides);
            let end = off + spt * gcr::SECTOR_SIZE;
            let bytes = if self.data.len() >= end {
                gcr::encode_track(track as usize, side as usize, sides, &self.data[off..end])
            } else {
                vec![0xFF; gcr::track_gcr_len(track as usize)]
            };
            self.tracks.insert(key, TrackBuf { bytes, modified: false });
        }
        self.tracks.get_mut(&key).unwrap()
    }

    // Decode every modified track back into the image and push it to the
    // backing file.
    fn flush_modified(&mut self) {
        let sides = self.kind.sides();
        let mut writes: Vec<(usize, Vec<u8>)> = Vec::new();
        for ((track, side), buf) in self.tracks.iter_mut() {
            if !buf.modified {
                continue;
            }
            buf.modified = false;
            for sector in gcr::decode_track(&buf.bytes) {
                if sector.track != *track as usize || sector.side != *side as usize {
                    maclog!(Cat::Iwm, Warn, "flush: sector addressed {}:{} found on {}:{}",
                        sector.track, sector.side, track, side);
                    continue;
                }
                let off = gcr::track_image_offset(*track as usize, *side as usize, sides)
                    + sector.sector * gcr::SECTOR_SIZE;
                if off + gcr::SECTOR_SIZE <= self.data.len() {
                    self.data[off..off + gcr::SECTOR_SIZE].copy_from_slice(&sector.data);
                    writes.push((off, sector.data.to_vec()));
                }
            }
        }
        if let Some(backing) = self.backing.as_mut() {
            if backing.writable() {
                for (off, bytes) in writes {
                    backing.write(off, &bytes);
                }
                backing.flush();
            }
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn attach_backing(&mut self, mut image: Box<dyn DiskImage>) -> Result<(), Error> {
        if image.filename() != self.filename {
            return Err(Error::BadRecord {
                record: "floppy",
                reason: format!("expected image {}, got {}", self.filename, image.filename()),
            });
        }
        let mut data = vec![0; image.size()];
        image.read(0, &mut data);
        self.data = data;
        self.backing = Some(image);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveState {
    pub track: u8,
    dirtn: i8,
    motor_on: bool,
    spinning_up: bool,
    track_offset: u32,
}

#[derive(Serialize, Deserialize)]
pub struct Drive {
    pub state: DriveState,
    pub disk: Option<Floppy>,
    present: bool,
}

impl Drive {
    fn new(present: bool) -> Self {
        Drive {
            state: DriveState { track: 0, dirtn: 1, motor_on: false, spinning_up: false, track_offset: 0 },
            disk: None,
            present,
        }
    }

    fn ready(&self) -> bool {
        self.state.motor_on && !self.state.spinning_up && self.disk.is_some()
    }
}

#[derive(Serialize, Deserialize)]
pub struct Iwm {
    ca0: bool,
    ca1: bool,
    ca2: bool,
    lstrb: bool,
    enable: bool,
    ext_drive: bool,
    q6: bool,
    q7: bool,
    pub sel: bool,
    mode: u8,
    drives: Vec<Drive>,
}

impl Iwm {
    pub fn new(drive_count: usize) -> Self {
        Iwm {
            ca0: false,
            ca1: false,
            ca2: false,
            lstrb: false,
            enable: false,
            ext_drive: false,
            q6: false,
            q7: false,
            sel: false,
            mode: 0,
            drives: vec![Drive::new(true), Drive::new(drive_count > 1)],
        }
    }

    fn drive_index(&self) -> usize {
        self.ext_drive as usize
    }

    fn drive(&self) -> &Drive {
        &self.drives[self.drive_index()]
    }

    fn drive_mut(&mut self) -> &mut Drive {
        let i = self.drive_index();
        &mut self.drives[i]
    }

    pub fn read(&mut self, addr: u32, sched: &mut Scheduler) -> u8 {
        let reg = ((addr >> 9) & 0xF) as usize;
        self.set_line(reg >> 1, reg & 1 == 1, sched);
        match (self.q6, self.q7) {
            (true, false) => self.status(sched),
            (false, true) => 0xC0, // handshake: write buffer empty, no underrun
            (false, false) => self.data_read(),
            (true, true) => 0xFF, // mode register is write-only
        }
    }

    pub fn write(&mut self, addr: u32, value: u8, sched: &mut Scheduler) {
        let reg = ((addr >> 9) & 0xF) as usize;
        self.set_line(reg >> 1, reg & 1 == 1, sched);
        if self.q6 && self.q7 {
            if self.enable {
                self.data_write(value);
            } else {
                self.write_mode(value);
            }
        }
    }

    pub fn write_mode(&mut self, value: u8) {
        self.mode = value & 0x1F;
    }

    // True when a write in the current line state lands in the mode register.
    pub fn mode_write_target(&self) -> bool {
        self.q6 && self.q7 && !self.enable
    }

    fn latch_mode(&self) -> bool {
        self.mode & 0x01 != 0
    }

    fn set_line(&mut self, line: usize, on: bool, sched: &mut Scheduler) {
        match line {
            LINE_CA0 => self.ca0 = on,
            LINE_CA1 => self.ca1 = on,
            LINE_CA2 => self.ca2 = on,
            LINE_LSTRB => {
                let rising = on && !self.lstrb;
                self.lstrb = on;
                if rising {
                    self.strobe_command(sched);
                }
            }
            LINE_ENABLE => self.enable = on,
            LINE_SELECT => self.ext_drive = on,
            LINE_Q6 => self.q6 = on,
            LINE_Q7 => self.q7 = on,
            _ => unreachable!("three-bit line index"),
        }
    }

    fn command_code(&self) -> u8 {
        ((self.ca2 as u8) << 3) | ((self.ca1 as u8) << 2) | ((self.ca0 as u8) << 1) | self.sel as u8
    }

    fn strobe_command(&mut self, sched: &mut Scheduler) {
        let code = self.command_code();
        let drive = self.drive_index();
        match code {
            CMD_TRACK_UP => self.drive_mut().state.dirtn = 1,
            CMD_TRACK_DOWN => self.drive_mut().state.dirtn = -1,
            CMD_TRACK_STEP => {
                let d = self.drive_mut();
                let t = d.state.track as i16 + d.state.dirtn as i16;
                d.state.track = t.max(0).min(MAX_TRACK as i16) as u8;
                d.state.track_offset = 0;
                maclog!(Cat::Iwm, Trace, "drive {} stepped to track {}", drive, d.state.track);
            }
            CMD_MOTOR_ON => {
                let d = self.drive_mut();
                if !d.state.motor_on {
                    d.state.motor_on = true;
                    d.state.spinning_up = true;
                    sched.schedule_ns(EventKind::IwmMotor { drive: drive as u8 }, 0, SPINUP_NS);
                }
            }
            CMD_MOTOR_OFF => {
                let d = self.drive_mut();
                d.state.motor_on = false;
                d.state.spinning_up = false;
                sched.remove(EventKind::IwmMotor { drive: drive as u8 });
            }
            CMD_EJECT => self.eject(drive),
            _ => {
                maclog!(Cat::Iwm, Debug, "unknown drive command {:x}", code);
            }
        }
    }

    // Spin-up complete; /READY asserts from here on.
    pub fn motor_ready(&mut self, drive: usize) {
        self.drives[drive].state.spinning_up = false;
    }

    pub fn eject(&mut self, drive: usize) {
        if let Some(mut disk) = self.drives[drive].disk.take() {
            disk.flush_modified();
            maclog!(Cat::Iwm, Info, "drive {} ejected {}", drive, disk.filename);
        }
        self.drives[drive].state.track_offset = 0;
    }

    pub fn insert_disk(&mut self, drive: usize, image: Box<dyn DiskImage>) -> Result<(), Error> {
        if self.drives[drive].disk.is_some() {
            return Err(Error::DriveOccupied(drive));
        }
        let floppy = Floppy::from_image(image)?;
        maclog!(Cat::Iwm, Info, "drive {} loaded {}", drive, floppy.filename);
        self.drives[drive].disk = Some(floppy);
        Ok(())
    }

    pub fn disk_present(&self, drive: usize) -> bool {
        self.drives[drive].disk.is_some()
    }

    pub fn flush(&mut self) {
        for d in self.drives.iter_mut() {
            if let Some(disk) = d.disk.as_mut() {
                disk.flush_modified();
            }
        }
    }

    fn head(&self) -> u8 {
        let d = self.drive();
        match d.disk.as_ref() {
            Some(f) if f.kind == FloppyKind::DoubleSided => self.sel as u8,
            _ => 0,
        }
    }

    fn status(&self, sched: &Scheduler) -> u8 {
        let sense = self.sense(sched);
        (self.mode & 0x1F) | ((self.enable as u8) << 5) | ((sense as u8) << 7)
    }

    fn sense(&self, sched: &Scheduler) -> bool {
        let code = self.command_code();
        let d = self.drive();
        let kind = d.disk.as_ref().map(|f| f.kind);
        match code {
            SENSE_DIRTN => d.state.dirtn < 0,
            SENSE_CSTIN => d.disk.is_none(),
            SENSE_STEP => true, // steps complete instantly
            SENSE_WRTPRT => d.disk.as_ref().map(|f| f.writable).unwrap_or(true),
            SENSE_MOTORON => !d.state.motor_on,
            SENSE_TK0 => d.state.track != 0,
            SENSE_SWITCHED => false,
            SENSE_TACH => self.tach(sched),
            // Instantaneous head data; the latch path reads whole bytes.
            SENSE_RDDATA0 | SENSE_RDDATA1 => false,
            SENSE_SUPERDRIVE => false,
            SENSE_DRVIN_HD => true,
            SENSE_SIDES => kind == Some(FloppyKind::SingleSided),
            SENSE_READY => !d.ready(),
            SENSE_INSTALLED => !d.present,
            SENSE_NEWINTF => true,
            _ => unreachable!(),
        }
    }

    // 60 tach pulses per revolution: 120 half-pulses, rate set by the zone's
    // spindle speed at the current track.
    fn tach(&self, sched: &Scheduler) -> bool {
        let track = self.drive().state.track as usize;
        let ns_per_rev = gcr::ns_per_revolution(track);
        let half = (sched.cycles_ns() % ns_per_rev) / (ns_per_rev / 120);
        half & 1 == 1
    }

    fn data_read(&mut self) -> u8 {
        if !self.enable {
            return 0xFF;
        }
        let head = self.head();
        let latch = self.latch_mode();
        let d = self.drive_mut();
        let track = d.state.track;
        let disk = match d.disk.as_mut() {
            Some(f) if f.kind.is_gcr() => f,
            _ => return 0xFF, // MFM media is unreadable through the IWM path
        };
        let buf = disk.track_buf_mut(track, head);
        let len = buf.bytes.len() as u32;
        let mut offset = d.state.track_offset % len;
        if latch {
            // Skip anything without the MSB; a valid nibble always has it.
            for _ in 0..len {
                let byte = buf.bytes[offset as usize];
                offset = (offset + 1) % len;
                if byte & 0x80 != 0 {
                    d.state.track_offset = offset;
                    return byte;
                }
            }
            d.state.track_offset = offset;
            0x00
        } else {
            let byte = buf.bytes[offset as usize];
            d.state.track_offset = (offset + 1) % len;
            byte
        }
    }

    fn data_write(&mut self, value: u8) {
        let head = self.head();
        let d = self.drive_mut();
        let track = d.state.track;
        let disk = match d.disk.as_mut() {
            Some(f) if f.kind.is_gcr() => f,
            _ => return,
        };
        if !disk.writable {
            return;
        }
        let buf = disk.track_buf_mut(track, head);
        let len = buf.bytes.len() as u32;
        let offset = d.state.track_offset % len;
        buf.bytes[offset as usize] = value;
        buf.modified = true;
        d.state.track_offset = (offset + 1) % len;
    }

    pub fn drive_state(&self, drive: usize) -> &DriveState {
        &self.drives[drive].state
    }

    pub fn disk_mut(&mut self, drive: usize) -> Option<&mut Floppy> {
        self.drives[drive].disk.as_mut()
    }
}
