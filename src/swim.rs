// SWIM, the SE/30 floppy controller: an IWM plus the ISM half that speaks
// MFM. The chip boots in IWM mode and switches to ISM after four consecutive
// mode-register writes whose bit 6 follows the 1,0,1,1 pattern; clearing bit
// 6 through the write-zeroes register switches back. ISM reads stream
// synthesised MFM sectors through a two-deep FIFO that tags address/data
// marks, with CRC-CCITT-16 over the documented spans. MFM writes are not
// supported; GCR media keeps going through the wrapped IWM.

use crate::iwm::Iwm;
use crate::logging::Cat;
use crate::scheduler::Scheduler;
use serde::{Deserialize, Serialize};

// ISM register file, address bits 11:9. Reads and writes decode differently.
const R_DATA: u32 = 0;
const R_MARK: u32 = 1;
const R_ERROR: u32 = 2;
const R_PARAM: u32 = 3;
const R_PHASE: u32 = 4;
const R_SETUP: u32 = 5;
const R_STATUS: u32 = 6;
const R_HANDSHAKE: u32 = 7;

const W_DATA: u32 = 0;
const W_MARK: u32 = 1;
const W_CRC: u32 = 2;
const W_PARAM: u32 = 3;
const W_PHASE: u32 = 4;
const W_SETUP: u32 = 5;
const W_ZEROES: u32 = 6;
const W_ONES: u32 = 7;

// Handshake bits.
const HS_DATA_AVAIL: u8 = 1 << 7;
const HS_MARK_BYTE: u8 = 1 << 6;
const HS_ERROR: u8 = 1 << 5;
const HS_FIFO_ROOM: u8 = 1 << 4;

// Mode register bit 6 is the IWM/ISM switch; the magic knock is 1,0,1,1.
const SWITCH_PATTERN: [bool; 4] = [true, false, true, true];
const MODE_ISM: u8 = 1 << 6;

const SECTOR_SIZE: usize = 512;
const SYNC_LEN: usize = 12;
const GAP2_LEN: usize = 22;
const GAP3_LEN: usize = 24;

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfmByte {
    pub value: u8,
    pub mark: bool,
}

fn plain(value: u8) -> MfmByte {
    MfmByte { value, mark: false }
}

fn mark(value: u8) -> MfmByte {
    MfmByte { value, mark: true }
}

// One MFM sector image: sync, A1 A1 A1 FE + CHS + size + CRC, gap, sync,
// A1 A1 A1 FB + data + CRC, gap. Sector ids are 1-based on the wire.
pub fn mfm_sector(cyl: u8, head: u8, sector: u8, data: &[u8]) -> Vec<MfmByte> {
    assert_eq!(data.len(), SECTOR_SIZE);
    let mut out = Vec::with_capacity(700);
    out.extend(std::iter::repeat(plain(0x00)).take(SYNC_LEN));
    out.extend(std::iter::repeat(mark(0xA1)).take(3));
    let addr = [0xFE, cyl, head, sector, 0x02];
    for &b in addr.iter() {
        out.push(plain(b));
    }
    let mut span = vec![0xA1, 0xA1, 0xA1];
    span.extend_from_slice(&addr);
    let crc = crc16_ccitt(&span);
    out.push(plain((crc >> 8) as u8));
    out.push(plain(crc as u8));
    out.extend(std::iter::repeat(plain(0x4E)).take(GAP2_LEN));
    out.extend(std::iter::repeat(plain(0x00)).take(SYNC_LEN));
    out.extend(std::iter::repeat(mark(0xA1)).take(3));
    out.push(plain(0xFB));
    for &b in data {
        out.push(plain(b));
    }
    let mut span = vec![0xA1, 0xA1, 0xA1, 0xFB];
    span.extend_from_slice(data);
    let crc = crc16_ccitt(&span);
    out.push(plain((crc >> 8) as u8));
    out.push(plain(crc as u8));
    out.extend(std::iter::repeat(plain(0x4E)).take(GAP3_LEN));
    out
}

#[derive(Serialize, Deserialize)]
pub struct Swim {
    pub iwm: Iwm,
    ism: bool,
    switch_count: u8,
    mode: u8,
    phase: u8,
    setup: u8,
    error: u8,
    params: Vec<u8>,
    param_ptr: u8,
    fifo: Vec<MfmByte>,
    stream_pos: u32,
    // Rebuilt on demand from the image; (track, head) it was built for.
    #[serde(skip)]
    stream: Vec<MfmByte>,
    #[serde(skip)]
    stream_key: Option<(u8, u8)>,
}

impl Swim {
    pub fn new(drive_count: usize) -> Self {
        Swim {
            iwm: Iwm::new(drive_count),
            ism: false,
            switch_count: 0,
            mode: 0,
            phase: 0,
            setup: 0,
            error: 0,
            params: vec![0; 16],
            param_ptr: 0,
            fifo: Vec::new(),
            stream_pos: 0,
            stream: Vec::new(),
            stream_key: None,
        }
    }

    pub fn ism_active(&self) -> bool {
        self.ism
    }

    pub fn read(&mut self, addr: u32, sched: &mut Scheduler) -> u8 {
        if !self.ism {
            return self.iwm.read(addr, sched);
        }
        let reg = (addr >> 9) & 0x7;
        match reg {
            R_DATA => self.pop_data(false),
            R_MARK => self.pop_data(true),
            R_ERROR => {
                let e = self.error;
                self.error = 0;
                e
            }
            R_PARAM => {
                let v = self.params[self.param_ptr as usize];
                self.param_ptr = (self.param_ptr + 1) % 16;
                v
            }
            R_PHASE => self.phase,
            R_SETUP => self.setup,
            R_STATUS => self.mode | MODE_ISM,
            R_HANDSHAKE => self.handshake(),
            _ => unreachable!(),
        }
    }

    pub fn write(&mut self, addr: u32, value: u8, sched: &mut Scheduler) {
        if !self.ism {
            // Watch the IWM mode register for the switch knock.
            self.iwm.write(addr, value, sched);
            if self.iwm.mode_write_target() {
                self.track_switch_pattern(value);
            }
            return;
        }
        let reg = (addr >> 9) & 0x7;
        match reg {
            W_DATA | W_MARK | W_CRC => {
                // MFM writes are not supported in this port.
                maclog!(Cat::Swim, Debug, "ISM write data {:02x} ignored", value);
            }
            W_PARAM => {
                self.params[self.param_ptr as usize] = value;
                self.param_ptr = (self.param_ptr + 1) % 16;
            }
            W_PHASE => self.phase = value,
            W_SETUP => {
                self.setup = value;
                self.param_ptr = 0;
            }
            W_ZEROES => {
                self.mode &= !value;
                if value & MODE_ISM != 0 {
                    maclog!(Cat::Swim, Info, "back to IWM mode");
                    self.ism = false;
                    self.switch_count = 0;
                    self.fifo.clear();
                }
            }
            W_ONES => self.mode |= value & !MODE_ISM,
            _ => unreachable!(),
        }
    }

    fn track_switch_pattern(&mut self, value: u8) {
        let bit = value & MODE_ISM != 0;
        if bit == SWITCH_PATTERN[self.switch_count as usize] {
            self.switch_count += 1;
            if self.switch_count as usize == SWITCH_PATTERN.len() {
                maclog!(Cat::Swim, Info, "ISM mode enabled");
                self.ism = true;
                self.switch_count = 0;
                self.fifo.clear();
                self.stream_pos = 0;
                self.stream_key = None;
            }
        } else {
            self.switch_count = if bit == SWITCH_PATTERN[0] { 1 } else { 0 };
        }
    }

    fn handshake(&mut self) -> u8 {
        self.refill();
        let mut v = HS_FIFO_ROOM;
        if let Some(head) = self.fifo.first() {
            v |= HS_DATA_AVAIL;
            if head.mark {
                v |= HS_MARK_BYTE;
            }
        }
        if self.error != 0 {
            v |= HS_ERROR;
        }
        v
    }

    fn pop_data(&mut self, want_mark: bool) -> u8 {
        self.refill();
        if self.fifo.is_empty() {
            self.error |= 0x01; // underrun
            return 0xFF;
        }
        let b = self.fifo.remove(0);
        if b.mark != want_mark {
            self.error |= 0x02; // mark/data mismatch
        }
        self.refill();
        b.value
    }

    // Keep two bytes of track stream staged, synthesising the current
    // track's MFM image on first touch.
    fn refill(&mut self) {
        let spt = match self.current_spt() {
            Some(n) => n,
            None => return,
        };
        let track = self.iwm.drive_state(0).track;
        let head = self.iwm.sel as u8;
        if self.stream_key != Some((track, head)) || self.stream.is_empty() {
            self.stream = self.build_stream(track, head, spt);
            self.stream_key = Some((track, head));
            if self.stream_pos as usize >= self.stream.len() {
                self.stream_pos = 0;
            }
        }
        while self.fifo.len() < 2 && !self.stream.is_empty() {
            let b = self.stream[self.stream_pos as usize];
            self.stream_pos = (self.stream_pos + 1) % self.stream.len() as u32;
            self.fifo.push(b);
        }
    }

    fn current_spt(&mut self) -> Option<usize> {
        self.iwm.disk_mut(0).and_then(|f| f.kind.mfm_sectors_per_track())
    }

    fn build_stream(&mut self, track: u8, head: u8, spt: usize) -> Vec<MfmByte> {
        let mut out = Vec::new();
        let disk = match self.iwm.disk_mut(0) {
            Some(f) => f,
            None => return out,
        };
        let data = disk.data();
        let zeros = [0u8; SECTOR_SIZE];
        for s in 0..spt {
            let off = ((track as usize * 2 + head as usize) * spt + s) * SECTOR_SIZE;
            let sector_data = if data.len() >= off + SECTOR_SIZE {
                &data[off..off + SECTOR_SIZE]
            } else {
                &zeros[..]
            };
            out.extend(mfm_sector(track, head, (s + 1) as u8, sector_data));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemImage;

    fn mode_write_addr() -> u32 {
        // Q6 set (reg 0xD) then Q7 set (reg 0xF) makes reg 0xF a mode write
        // while the drive is disabled.
        0xF << 9
    }

    fn knock(swim: &mut Swim, sched: &mut Scheduler, bits: &[bool]) {
        // Raise Q6 so mode writes reach the register.
        swim.write(0xD << 9, 0, sched);
        for &b in bits {
            let v = if b { MODE_ISM } else { 0 };
            swim.write(mode_write_addr(), v | 0x17, sched);
        }
    }

    #[test]
    fn crc_ccitt_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn switch_knock_enables_ism() {
        let mut sched = Scheduler::new();
        let mut swim = Swim::new(1);
        knock(&mut swim, &mut sched, &[true, false, true, true]);
        assert!(swim.ism_active());
    }

    #[test]
    fn wrong_knock_stays_in_iwm_mode() {
        let mut sched = Scheduler::new();
        let mut swim = Swim::new(1);
        knock(&mut swim, &mut sched, &[true, true, true, true]);
        assert!(!swim.ism_active());
        // A correct knock still works afterwards.
        knock(&mut swim, &mut sched, &[false, true, false, true, true]);
        assert!(swim.ism_active());
    }

    #[test]
    fn write_zeroes_with_bit6_returns_to_iwm() {
        let mut sched = Scheduler::new();
        let mut swim = Swim::new(1);
        knock(&mut swim, &mut sched, &[true, false, true, true]);
        assert!(swim.ism_active());
        swim.write(W_ZEROES << 9, MODE_ISM, &mut sched);
        assert!(!swim.ism_active());
    }

    #[test]
    fn mfm_sector_layout_and_crcs() {
        let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        let sector = mfm_sector(7, 1, 3, &data);
        let bytes: Vec<u8> = sector.iter().map(|b| b.value).collect();
        // Address mark after the first sync run.
        assert_eq!(&bytes[SYNC_LEN..SYNC_LEN + 4], &[0xA1, 0xA1, 0xA1, 0xFE]);
        assert!(sector[SYNC_LEN].mark && !sector[SYNC_LEN + 3].mark);
        assert_eq!(&bytes[SYNC_LEN + 4..SYNC_LEN + 8], &[7, 1, 3, 2]);
        let addr_crc = ((bytes[SYNC_LEN + 8] as u16) << 8) | bytes[SYNC_LEN + 9] as u16;
        assert_eq!(addr_crc, crc16_ccitt(&bytes[SYNC_LEN..SYNC_LEN + 8]));
        // Data mark after gap2 and the second sync run.
        let dstart = SYNC_LEN + 10 + GAP2_LEN + SYNC_LEN;
        assert_eq!(&bytes[dstart..dstart + 4], &[0xA1, 0xA1, 0xA1, 0xFB]);
        assert_eq!(&bytes[dstart + 4..dstart + 4 + 512], &data[..]);
        let data_crc =
            ((bytes[dstart + 516] as u16) << 8) | bytes[dstart + 517] as u16;
        assert_eq!(data_crc, crc16_ccitt(&bytes[dstart..dstart + 516]));
    }

    #[test]
    fn ism_streams_sectors_through_the_fifo() {
        let mut sched = Scheduler::new();
        let mut swim = Swim::new(1);
        let mut img = vec![0u8; 720 * 1024];
        for (i, b) in img.iter_mut().enumerate() {
            *b = (i / 512) as u8;
        }
        swim.iwm.insert_disk(0, Box::new(MemImage::new("mfm.img", img, false))).unwrap();
        knock(&mut swim, &mut sched, &[true, false, true, true]);
        // Skip the sync run, then expect the three marked A1s.
        for _ in 0..SYNC_LEN {
            assert_eq!(swim.read(R_DATA << 9, &mut sched), 0x00);
        }
        for _ in 0..3 {
            let hs = swim.read(R_HANDSHAKE << 9, &mut sched);
            assert_ne!(hs & HS_DATA_AVAIL, 0);
            assert_ne!(hs & HS_MARK_BYTE, 0);
            assert_eq!(swim.read(R_MARK << 9, &mut sched), 0xA1);
        }
        assert_eq!(swim.read(R_DATA << 9, &mut sched), 0xFE);
        // CHS of track 0, head 0, sector 1
        assert_eq!(swim.read(R_DATA << 9, &mut sched), 0);
        assert_eq!(swim.read(R_DATA << 9, &mut sched), 0);
        assert_eq!(swim.read(R_DATA << 9, &mut sched), 1);
    }

    #[test]
    fn gcr_media_is_invisible_to_ism() {
        let mut sched = Scheduler::new();
        let mut swim = Swim::new(1);
        swim.iwm
            .insert_disk(0, Box::new(MemImage::blank("gcr.img", 400 * 1024)))
            .unwrap();
        knock(&mut swim, &mut sched, &[true, false, true, true]);
        let hs = swim.read(R_HANDSHAKE << 9, &mut sched);
        assert_eq!(hs & HS_DATA_AVAIL, 0);
    }
}
