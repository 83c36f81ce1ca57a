// NCR 5380 SCSI controller, single initiator, polled I/O only. The guest
// drives the whole protocol through the chip registers: arbitrate via the
// mode register, select by dropping BSY with SEL held, then march through
// command/data/status/message phases with REQ/ACK handshakes on the initiator
// command register. Targets are disk images; an absent target simply drops
// the bus back to free, which is all the error handling the real bus had.

use crate::disk::DiskImage;
use crate::logging::Cat;
use serde::{Deserialize, Serialize};

// Register file, address bits 6:4.
const REG_CDR_ODR: u32 = 0; // current data (r) / output data (w)
const REG_ICR: u32 = 1;
const REG_MR: u32 = 2;
const REG_TCR: u32 = 3;
const REG_CSR_SER: u32 = 4; // bus status (r) / select enable (w)
const REG_BSR_DMA: u32 = 5;
const REG_IDR: u32 = 6;
const REG_RPI: u32 = 7;

// ICR bits.
const ICR_DATA_BUS: u8 = 1 << 0;
const ICR_SEL: u8 = 1 << 2;
const ICR_BSY: u8 = 1 << 3;
const ICR_ACK: u8 = 1 << 4;
const ICR_RST: u8 = 1 << 7;

// MR bits.
const MR_ARBITRATE: u8 = 1 << 0;

// CSR bits.
const CSR_DBP: u8 = 1 << 0;
const CSR_SEL: u8 = 1 << 1;
const CSR_IO: u8 = 1 << 2;
const CSR_CD: u8 = 1 << 3;
const CSR_MSG: u8 = 1 << 4;
const CSR_REQ: u8 = 1 << 5;
const CSR_BSY: u8 = 1 << 6;

const STATUS_GOOD: u8 = 0x00;
const MSG_CMD_COMPLETE: u8 = 0x00;

pub const BLOCK_SIZE: usize = 512;
// Transfers are bounded to 128 KiB, the largest a Read-6/Write-6 can ask for.
const MAX_TRANSFER: usize = 128 * 1024;

const OP_TEST_UNIT_READY: u8 = 0x00;
const OP_FORMAT_UNIT: u8 = 0x04;
const OP_READ6: u8 = 0x08;
const OP_WRITE6: u8 = 0x0A;
const OP_INQUIRY: u8 = 0x12;
const OP_MODE_SELECT: u8 = 0x15;
const OP_READ_CAPACITY: u8 = 0x25;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Phase {
    BusFree,
    Arbitration,
    Command,
    DataIn,
    DataOut,
    Status,
    MessageIn,
}

// A disk behind a target ID. The image is wiring; identity and inquiry
// strings are state.
#[derive(Serialize, Deserialize)]
pub struct Target {
    pub filename: String,
    vendor: String,
    product: String,
    blocks: u32,
    #[serde(skip)]
    image: Option<Box<dyn DiskImage>>,
}

impl Target {
    pub fn new(image: Box<dyn DiskImage>, vendor: &str, product: &str) -> Self {
        Target {
            filename: image.filename().to_string(),
            vendor: format!("{:<8.8}", vendor),
            product: format!("{:<16.16}", product),
            blocks: (image.size() / BLOCK_SIZE) as u32,
            image: Some(image),
        }
    }

    pub fn attach_backing(&mut self, image: Box<dyn DiskImage>) -> Result<(), crate::error::Error> {
        if image.filename() != self.filename {
            return Err(crate::error::Error::BadRecord {
                record: "scsi target",
                reason: format!("expected image {}, got {}", self.filename, image.filename()),
            });
        }
        self.blocks = (image.size() / BLOCK_SIZE) as u32;
        self.image = Some(image);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
pub struct Scsi {
    phase: Phase,
    odr: u8,
    icr: u8,
    mr: u8,
    tcr: u8,
    ser: u8,
    aip: bool,
    initiator_id: u8,
    selected: Option<u8>,
    cmd: Vec<u8>,
    data: Vec<u8>,
    data_pos: usize,
    status_byte: u8,
    message_byte: u8,
    write_lba: u32,
    write_pending: bool,
    targets: Vec<Option<Target>>,
}

impl Scsi {
    pub fn new() -> Self {
        Scsi {
            phase: Phase::BusFree,
            odr: 0,
            icr: 0,
            mr: 0,
            tcr: 0,
            ser: 0,
            aip: false,
            initiator_id: 7,
            selected: None,
            cmd: Vec::new(),
            data: Vec::new(),
            data_pos: 0,
            status_byte: STATUS_GOOD,
            message_byte: MSG_CMD_COMPLETE,
            write_lba: 0,
            write_pending: false,
            targets: (0..8).map(|_| None).collect(),
        }
    }

    pub fn attach_target(&mut self, id: u8, target: Target) -> Result<(), crate::error::Error> {
        if id > 7 || self.targets[id as usize].is_some() {
            return Err(crate::error::Error::ScsiTarget(id));
        }
        maclog!(Cat::Scsi, Info, "target {} is {}", id, target.filename);
        self.targets[id as usize] = Some(target);
        Ok(())
    }

    pub fn target_mut(&mut self, id: u8) -> Option<&mut Target> {
        self.targets[id as usize].as_mut()
    }

    pub fn irq_asserted(&self) -> bool {
        false // polled operation only; the 5380 IRQ is not wired on the Plus
    }

    pub fn read(&mut self, offset: u32) -> u8 {
        match (offset >> 4) & 7 {
            REG_CDR_ODR => self.current_data(),
            REG_ICR => self.icr,
            REG_MR => {
                let mut v = self.mr;
                if self.aip {
                    v |= 0x40; // arbitration in progress readback
                }
                v
            }
            REG_TCR => self.tcr,
            REG_CSR_SER => self.bus_status(),
            REG_BSR_DMA => 0x08, // phase match
            REG_IDR => self.current_data(),
            REG_RPI => 0,
            _ => unreachable!(),
        }
    }

    pub fn write(&mut self, offset: u32, value: u8) {
        match (offset >> 4) & 7 {
            REG_CDR_ODR => self.odr = value,
            REG_ICR => self.write_icr(value),
            REG_MR => self.write_mr(value),
            REG_TCR => self.tcr = value,
            REG_CSR_SER => self.ser = value,
            REG_BSR_DMA | REG_IDR | REG_RPI => {}
            _ => unreachable!(),
        }
    }

    fn write_mr(&mut self, value: u8) {
        let was = self.mr;
        self.mr = value;
        if value & MR_ARBITRATE != 0 && was & MR_ARBITRATE == 0 {
            // Single initiator: arbitration is always won. AIP sets, the bus
            // latches the arbitrating IDs.
            self.aip = true;
            self.initiator_id = lowest_bit(self.odr).unwrap_or(7);
            self.phase = Phase::Arbitration;
            maclog!(Cat::Scsi, Trace, "arbitration won by {}", self.initiator_id);
        }
        if value & MR_ARBITRATE == 0 {
            self.aip = false;
        }
    }

    fn write_icr(&mut self, value: u8) {
        let was = self.icr;
        self.icr = value;
        if value & ICR_RST != 0 {
            self.bus_free();
            return;
        }
        let bsy_dropped = was & ICR_BSY != 0 && value & ICR_BSY == 0;
        let ack_rose = was & ICR_ACK == 0 && value & ICR_ACK != 0;
        if self.phase == Phase::Arbitration && value & ICR_SEL != 0 && bsy_dropped {
            self.finish_selection();
        } else if ack_rose {
            self.ack_strobe();
        }
    }

    // Releasing BSY with SEL still held ends selection; the winning data bus
    // bit (minus our own) names the target.
    fn finish_selection(&mut self) {
        self.aip = false;
        let candidates = self.odr & !(1 << self.initiator_id);
        let id = match lowest_bit(candidates) {
            Some(id) => id,
            None => {
                self.bus_free();
                return;
            }
        };
        if self.targets[id as usize].is_none() {
            maclog!(Cat::Scsi, Debug, "selection of absent target {}", id);
            self.bus_free();
            return;
        }
        self.selected = Some(id);
        self.cmd.clear();
        self.phase = Phase::Command;
        maclog!(Cat::Scsi, Trace, "target {} selected", id);
    }

    fn bus_free(&mut self) {
        self.phase = Phase::BusFree;
        self.selected = None;
        self.aip = false;
        self.cmd.clear();
        self.data.clear();
        self.data_pos = 0;
        self.write_pending = false;
    }

    fn current_data(&self) -> u8 {
        match self.phase {
            Phase::DataIn => self.data.get(self.data_pos).copied().unwrap_or(0),
            Phase::Status => self.status_byte,
            Phase::MessageIn => self.message_byte,
            _ => self.odr,
        }
    }

    fn bus_status(&self) -> u8 {
        let mut v = 0;
        if self.icr & ICR_SEL != 0 {
            v |= CSR_SEL;
        }
        if self.icr & ICR_DATA_BUS != 0 {
            v |= CSR_DBP;
        }
        match self.phase {
            Phase::BusFree | Phase::Arbitration => v,
            Phase::Command => v | CSR_BSY | CSR_REQ | CSR_CD,
            Phase::DataOut => v | CSR_BSY | CSR_REQ,
            Phase::DataIn => v | CSR_BSY | CSR_REQ | CSR_IO,
            Phase::Status => v | CSR_BSY | CSR_REQ | CSR_CD | CSR_IO,
            Phase::MessageIn => v | CSR_BSY | CSR_REQ | CSR_MSG | CSR_CD | CSR_IO,
        }
    }

    // One REQ/ACK handshake. What moves depends on the phase.
    fn ack_strobe(&mut self) {
        match self.phase {
            Phase::Command => {
                self.cmd.push(self.odr);
                let expect = cdb_len(self.cmd[0]);
                if self.cmd.len() == expect {
                    self.dispatch();
                }
            }
            Phase::DataIn => {
                self.data_pos += 1;
                if self.data_pos >= self.data.len() {
                    self.enter_status();
                }
            }
            Phase::DataOut => {
                self.data.push(self.odr);
                if self.data.len() >= self.data_pos {
                    self.finish_data_out();
                }
            }
            Phase::Status => {
                self.phase = Phase::MessageIn;
            }
            Phase::MessageIn => {
                self.bus_free();
            }
            _ => {}
        }
    }

    fn enter_status(&mut self) {
        self.status_byte = STATUS_GOOD;
        self.message_byte = MSG_CMD_COMPLETE;
        self.phase = Phase::Status;
    }

    fn enter_data_in(&mut self, data: Vec<u8>) {
        self.data = data;
        self.data_pos = 0;
        self.phase = Phase::DataIn;
    }

    fn enter_data_out(&mut self, expect: usize) {
        self.data = Vec::with_capacity(expect);
        self.data_pos = expect; // repurposed as the expected count
        self.phase = Phase::DataOut;
    }

    fn dispatch(&mut self) {
        let op = self.cmd[0];
        maclog!(Cat::Scsi, Debug, "command {:02x} to target {:?}", op, self.selected);
        match op {
            OP_TEST_UNIT_READY | OP_FORMAT_UNIT => self.enter_status(),
            OP_INQUIRY => {
                let reply = self.build_inquiry();
                let alloc = self.cmd[4] as usize;
                let mut data = reply;
                data.truncate(alloc.max(1));
                self.enter_data_in(data);
            }
            OP_READ_CAPACITY => {
                let blocks = self.target().map(|t| t.blocks).unwrap_or(0);
                let last = blocks.saturating_sub(1);
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&last.to_be_bytes());
                data.extend_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
                self.enter_data_in(data);
            }
            OP_READ6 => {
                let (lba, blocks) = self.parse_rw6();
                let mut data = vec![0; blocks as usize * BLOCK_SIZE];
                if let Some(t) = self.target_image() {
                    t.read(lba as usize * BLOCK_SIZE, &mut data);
                }
                self.enter_data_in(data);
            }
            OP_WRITE6 => {
                let (lba, blocks) = self.parse_rw6();
                self.write_lba = lba;
                self.write_pending = true;
                self.enter_data_out(blocks as usize * BLOCK_SIZE);
            }
            OP_MODE_SELECT => {
                self.write_pending = false;
                let len = self.cmd[4] as usize;
                self.enter_data_out(len.max(1));
            }
            _ => {
                maclog!(Cat::Scsi, Warn, "unimplemented opcode {:02x}", op);
                self.enter_status();
            }
        }
    }

    fn finish_data_out(&mut self) {
        if self.write_pending {
            let lba = self.write_lba;
            let data = std::mem::replace(&mut self.data, Vec::new());
            if let Some(t) = self.target_image() {
                t.write(lba as usize * BLOCK_SIZE, &data);
                t.flush();
            }
            self.write_pending = false;
        }
        self.enter_status();
    }

    // 21-bit LBA; a transfer length byte of zero means 256 blocks. The field
    // is 8 bits wide before the mapping, so only zero wraps.
    fn parse_rw6(&self) -> (u32, u32) {
        let lba = ((self.cmd[1] as u32 & 0x1F) << 16) | ((self.cmd[2] as u32) << 8) | self.cmd[3] as u32;
        let tl = self.cmd[4];
        let blocks = ((tl as u32).wrapping_sub(1) & 0xFF) + 1;
        let blocks = blocks.min((MAX_TRANSFER / BLOCK_SIZE) as u32);
        (lba, blocks)
    }

    fn build_inquiry(&mut self) -> Vec<u8> {
        let mut data = vec![0u8; 36];
        data[2] = 0x02;
        data[3] = 0x02;
        data[4] = 32;
        if let Some(t) = self.target() {
            data[8..16].copy_from_slice(t.vendor.as_bytes());
            data[16..32].copy_from_slice(t.product.as_bytes());
        }
        data[32..36].copy_from_slice(b"1.0 ");
        data
    }

    fn target(&self) -> Option<&Target> {
        self.selected.and_then(|id| self.targets[id as usize].as_ref())
    }

    fn target_image(&mut self) -> Option<&mut Box<dyn DiskImage>> {
        let id = self.selected?;
        self.targets[id as usize].as_mut().and_then(|t| t.image.as_mut())
    }
}

fn lowest_bit(value: u8) -> Option<u8> {
    if value == 0 {
        None
    } else {
        Some(value.trailing_zeros() as u8)
    }
}

fn cdb_len(opcode: u8) -> usize {
    if opcode < 0x20 {
        6
    } else {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemImage;

    fn disk_target(size: usize) -> Target {
        let mut data = vec![0u8; size];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i / BLOCK_SIZE) as u8;
        }
        Target::new(Box::new(MemImage::new("hd.img", data, true)), "ACME", "DISK")
    }

    // Drive the register protocol the way the ROM does.
    fn select(scsi: &mut Scsi, target: u8) {
        scsi.write(0x00, 1 << 7); // our ID on the bus
        scsi.write(0x20, MR_ARBITRATE);
        scsi.write(0x00, (1 << 7) | (1 << target));
        scsi.write(0x10, ICR_SEL | ICR_BSY | ICR_DATA_BUS);
        scsi.write(0x10, ICR_SEL | ICR_DATA_BUS); // release BSY: selection ends
        scsi.write(0x20, 0);
        scsi.write(0x10, 0);
    }

    fn send_cdb(scsi: &mut Scsi, cdb: &[u8]) {
        for &b in cdb {
            scsi.write(0x00, b);
            scsi.write(0x10, ICR_ACK);
            scsi.write(0x10, 0);
        }
    }

    fn read_data(scsi: &mut Scsi, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(scsi.read(0x00));
            scsi.write(0x10, ICR_ACK);
            scsi.write(0x10, 0);
        }
        out
    }

    fn finish(scsi: &mut Scsi) {
        // status, then message in, then bus free
        assert_eq!(scsi.read(0x00), STATUS_GOOD);
        scsi.write(0x10, ICR_ACK);
        scsi.write(0x10, 0);
        assert_eq!(scsi.read(0x00), MSG_CMD_COMPLETE);
        scsi.write(0x10, ICR_ACK);
        scsi.write(0x10, 0);
        assert_eq!(scsi.read(0x40) & CSR_BSY, 0);
    }

    #[test]
    fn inquiry_reports_vendor_and_product() {
        let mut scsi = Scsi::new();
        scsi.attach_target(0, disk_target(BLOCK_SIZE * 64)).unwrap();
        select(&mut scsi, 0);
        assert_ne!(scsi.read(0x40) & CSR_BSY, 0);
        send_cdb(&mut scsi, &[OP_INQUIRY, 0, 0, 0, 36, 0]);
        let data = read_data(&mut scsi, 36);
        assert_eq!(&data[8..16], b"ACME    ");
        assert_eq!(&data[16..32], b"DISK            ");
        assert_eq!(data[4], 32);
        finish(&mut scsi);
    }

    #[test]
    fn selection_of_absent_target_drops_to_bus_free() {
        let mut scsi = Scsi::new();
        select(&mut scsi, 3);
        assert_eq!(scsi.read(0x40) & CSR_BSY, 0);
    }

    #[test]
    fn read6_returns_block_data() {
        let mut scsi = Scsi::new();
        scsi.attach_target(0, disk_target(BLOCK_SIZE * 64)).unwrap();
        select(&mut scsi, 0);
        send_cdb(&mut scsi, &[OP_READ6, 0, 0, 5, 2, 0]);
        let data = read_data(&mut scsi, 2 * BLOCK_SIZE);
        assert!(data[..BLOCK_SIZE].iter().all(|&b| b == 5));
        assert!(data[BLOCK_SIZE..].iter().all(|&b| b == 6));
        finish(&mut scsi);
    }

    #[test]
    fn read6_length_zero_means_256_blocks() {
        let mut scsi = Scsi::new();
        scsi.attach_target(0, disk_target(BLOCK_SIZE * 512)).unwrap();
        select(&mut scsi, 0);
        send_cdb(&mut scsi, &[OP_READ6, 0, 0, 0, 0, 0]);
        let data = read_data(&mut scsi, 256 * BLOCK_SIZE);
        assert_eq!(data.len(), 256 * BLOCK_SIZE);
        assert!(data[255 * BLOCK_SIZE..].iter().all(|&b| b == 255));
        finish(&mut scsi);
    }

    #[test]
    fn write6_commits_on_completion() {
        let mut scsi = Scsi::new();
        scsi.attach_target(0, disk_target(BLOCK_SIZE * 64)).unwrap();
        select(&mut scsi, 0);
        send_cdb(&mut scsi, &[OP_WRITE6, 0, 0, 9, 1, 0]);
        for _ in 0..BLOCK_SIZE {
            scsi.write(0x00, 0xA5);
            scsi.write(0x10, ICR_ACK);
            scsi.write(0x10, 0);
        }
        finish(&mut scsi);
        // Read it back.
        select(&mut scsi, 0);
        send_cdb(&mut scsi, &[OP_READ6, 0, 0, 9, 1, 0]);
        let data = read_data(&mut scsi, BLOCK_SIZE);
        assert!(data.iter().all(|&b| b == 0xA5));
        finish(&mut scsi);
    }

    #[test]
    fn read_capacity_is_big_endian() {
        let mut scsi = Scsi::new();
        scsi.attach_target(0, disk_target(BLOCK_SIZE * 1000)).unwrap();
        select(&mut scsi, 0);
        send_cdb(&mut scsi, &[OP_READ_CAPACITY, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let data = read_data(&mut scsi, 8);
        assert_eq!(u32::from_be_bytes([data[0], data[1], data[2], data[3]]), 999);
        assert_eq!(u32::from_be_bytes([data[4], data[5], data[6], data[7]]), 512);
        finish(&mut scsi);
    }

    #[test]
    fn test_unit_ready_goes_straight_to_status() {
        let mut scsi = Scsi::new();
        scsi.attach_target(0, disk_target(BLOCK_SIZE * 8)).unwrap();
        select(&mut scsi, 0);
        send_cdb(&mut scsi, &[OP_TEST_UNIT_READY, 0, 0, 0, 0, 0]);
        finish(&mut scsi);
    }
}
