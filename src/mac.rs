// The machine itself: model geometry, the bus that owns every device and
// decodes MMIO, interrupt aggregation, the VBL, and the Machine facade that
// couples a CPU to the bus and runs the sprint loop. Cross-device wiring all
// happens here, by plain function call with the bus on top of the stack: VIA
// port writes fan out to the RTC lines, ADB state machine, floppy SEL and
// sound switches; completed shifts route to the keyboard or ADB; mouse pulse
// trains land on SCC DCD inputs and VIA port bits.

use crate::adb::AdbTransceiver;
use crate::asc::Asc;
use crate::cpu::Cpu;
use crate::debugger::Debugger;
use crate::disk::DiskImage;
use crate::error::Error;
use crate::iwm::DriveState;
use crate::keyboard::{adb_code, Key, PlusKeyboard};
use crate::logging::Cat;
use crate::memory::{DeviceId, MemoryMap, Region, Width};
use crate::mouse::QuadMouse;
use crate::rtc::Rtc;
use crate::scc::{Scc, CH_A, CH_B};
use crate::scheduler::{Event, EventKind, Scheduler, SpeedMode, VBL_PERIOD};
use crate::scsi::{Scsi, Target};
use crate::sound::{PlusSound, SAMPLES_PER_VBL};
use crate::swim::Swim;
use crate::via::{Port, PortOut, Via};
use serde::{Deserialize, Serialize};

pub const FB_WIDTH: usize = 512;
pub const FB_HEIGHT: usize = 342;
pub const FB_BYTES: usize = FB_WIDTH * FB_HEIGHT / 8;

// Screen pages sit below the top of RAM, like the sound pages.
const VIDEO_MAIN_OFFSET: usize = 0x5900;
const VIDEO_ALT_EXTRA: usize = 0x8000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacModel {
    Plus,
    SE30,
}

impl MacModel {
    pub fn name(&self) -> &'static str {
        match *self {
            MacModel::Plus => "Macintosh Plus",
            MacModel::SE30 => "Macintosh SE/30",
        }
    }

    pub fn default_ram_size(&self) -> usize {
        match *self {
            MacModel::Plus => 0x400000,  // 4 MB
            MacModel::SE30 => 0x800000,  // 8 MB
        }
    }

    pub fn address_mask(&self) -> u32 {
        match *self {
            MacModel::Plus => 0x00FF_FFFF,
            MacModel::SE30 => 0xFFFF_FFFF,
        }
    }

    pub fn has_adb(&self) -> bool {
        *self == MacModel::SE30
    }

    pub fn fdd_drives(&self) -> usize {
        2
    }
}

pub trait AudioSink {
    // One VBL's worth of 8-bit samples plus the 3-bit volume; the sink owns
    // silence detection and latency.
    fn push(&mut self, samples: &[u8], volume: u8);
}

pub struct Bus {
    pub model: MacModel,
    pub map: MemoryMap,
    pub scheduler: Scheduler,
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
    pub overlay: bool,
    pub(crate) video_alt: bool,
}

impl Bus {
    pub fn new(model: MacModel, rom: Vec<u8>, ram_size: usize) -> Self {
        let mut bus = Bus {
            model,
            map: MemoryMap::new(ram_size, rom),
            scheduler: Scheduler::new(),
            via1: Via::new(0),
            via2: Via::new(1),
            scc: Scc::new(),
            swim: Swim::new(model.fdd_drives()),
            scsi: Scsi::new(),
            rtc: Rtc::new(),
            asc: Asc::new(),
            adb: AdbTransceiver::new(),
            kbd: PlusKeyboard::new(),
            mouse: QuadMouse::new(),
            sound: PlusSound::new(),
            overlay: true,
            video_alt: false,
        };
        bus.map_devices();
        bus.map_overlay_ranges();
        bus.rtc.start(&mut bus.scheduler);
        bus
    }

    fn map_devices(&mut self) {
        match self.model {
            MacModel::Plus => {
                self.map.add_range(0x40_0000, 0x10_0000, "rom", Region::Rom);
                self.map.add_range(0x58_0000, 0x8_0000, "scsi", Region::Device(DeviceId::Scsi));
                self.map.add_range(0x80_0000, 0x20_0000, "scc-rd", Region::Device(DeviceId::Scc));
                self.map.add_range(0xA0_0000, 0x20_0000, "scc-wr", Region::Device(DeviceId::Scc));
                self.map.add_range(0xD0_0000, 0x10_0000, "iwm", Region::Device(DeviceId::Iwm));
                self.map.add_range(0xE8_0000, 0x8_0000, "via", Region::Device(DeviceId::Via1));
            }
            MacModel::SE30 => {
                self.map.add_range(0x4000_0000, 0x1000_0000, "rom", Region::Rom);
                self.map.add_range(0x5000_0000, 0x2000, "via1", Region::Device(DeviceId::Via1));
                self.map.add_range(0x5000_2000, 0x2000, "via2", Region::Device(DeviceId::Via2));
                self.map.add_range(0x5000_4000, 0x2000, "scc", Region::Device(DeviceId::Scc));
                self.map.add_range(0x5001_0000, 0x2000, "scsi", Region::Device(DeviceId::Scsi));
                self.map.add_range(0x5001_4000, 0x2000, "asc", Region::Device(DeviceId::Asc));
                self.map.add_range(0x5001_6000, 0x2000, "iwm", Region::Device(DeviceId::Iwm));
            }
        }
    }

    // At reset the ROM answers at address zero and RAM hides; clearing the
    // overlay bit swaps the low ranges over.
    fn map_overlay_ranges(&mut self) {
        match self.model {
            MacModel::Plus => {
                self.map.add_range(0x00_0000, 0x10_0000, "ovl-rom", Region::Rom);
                self.map.add_range(0x60_0000, 0x20_0000, "ovl-ram", Region::Ram);
            }
            MacModel::SE30 => {
                self.map.add_range(0x0000_0000, 0x4000_0000, "ovl-rom", Region::Rom);
            }
        }
    }

    fn clear_overlay(&mut self) {
        if !self.overlay {
            return;
        }
        maclog!(Cat::Mem, Debug, "overlay off");
        self.overlay = false;
        self.map.remove_range("ovl-rom");
        if self.map.has_range("ovl-ram") {
            self.map.remove_range("ovl-ram");
        }
        match self.model {
            MacModel::Plus => self.map.add_range(0x00_0000, 0x40_0000, "ram", Region::Ram),
            MacModel::SE30 => self.map.add_range(0x0000_0000, 0x4000_0000, "ram", Region::Ram),
        }
    }

    // Rebuild the overlay state after a restore.
    pub fn set_overlay_restored(&mut self, overlay: bool) {
        if !overlay {
            self.clear_overlay();
        }
    }

    pub fn read(&mut self, addr: u32, width: Width) -> u32 {
        let addr = addr & self.model.address_mask();
        let entry = match self.map.lookup(addr) {
            Some(e) => e,
            None => {
                maclog!(Cat::Mem, Debug, "read from unmapped {:08x}", addr);
                return 0;
            }
        };
        match entry.region {
            Region::Ram | Region::Rom => self.map.read_backing(&entry, addr, width),
            Region::Device(id) => {
                if !promotes_wide(id) && width != Width::Byte {
                    panic!("wide access to byte-only device at {:08x}", addr);
                }
                let mut value = 0u32;
                for i in 0..width as u32 {
                    value = (value << 8) | self.device_read8(id, addr + i) as u32;
                }
                value
            }
        }
    }

    pub fn write(&mut self, addr: u32, width: Width, value: u32) {
        let addr = addr & self.model.address_mask();
        let entry = match self.map.lookup(addr) {
            Some(e) => e,
            None => {
                maclog!(Cat::Mem, Debug, "write to unmapped {:08x} dropped", addr);
                return;
            }
        };
        match entry.region {
            Region::Ram | Region::Rom => self.map.write_backing(&entry, addr, width, value),
            Region::Device(id) => {
                if !promotes_wide(id) && width != Width::Byte {
                    panic!("wide access to byte-only device at {:08x}", addr);
                }
                let n = width as u32;
                for i in 0..n {
                    let byte = (value >> (8 * (n - 1 - i))) as u8;
                    self.device_write8(id, addr + i, byte);
                }
            }
        }
    }

    fn device_read8(&mut self, id: DeviceId, addr: u32) -> u8 {
        match id {
            DeviceId::Via1 => self.via1.read(via_reg(addr), &mut self.scheduler),
            DeviceId::Via2 => self.via2.read(via_reg(addr), &mut self.scheduler),
            DeviceId::Scc => self.scc.read(addr & 0x7, &mut self.scheduler),
            DeviceId::Iwm => self.swim.read(addr, &mut self.scheduler),
            DeviceId::Scsi => self.scsi.read(addr),
            DeviceId::Asc => self.asc_read(addr & 0xFFF),
        }
    }

    fn device_write8(&mut self, id: DeviceId, addr: u32, value: u8) {
        match id {
            DeviceId::Via1 => {
                if let Some(out) = self.via1.write(via_reg(addr), value, &mut self.scheduler) {
                    self.via1_port_out(out);
                }
            }
            DeviceId::Via2 => {
                if self.via2.write(via_reg(addr), value, &mut self.scheduler).is_some() {
                    maclog!(Cat::Via, Trace, "via2 port output ignored");
                }
            }
            DeviceId::Scc => self.scc.write(addr & 0x7, value, &mut self.scheduler),
            DeviceId::Iwm => self.swim.write(addr, value, &mut self.scheduler),
            DeviceId::Scsi => self.scsi.write(addr, value),
            DeviceId::Asc => {
                self.asc.write(addr & 0xFFF, value);
                self.sync_asc_irq();
            }
        }
    }

    fn asc_read(&mut self, offset: u32) -> u8 {
        let v = self.asc.read(offset);
        self.sync_asc_irq();
        v
    }

    // The aggregate FIFO flags drive the audio VIA's CB1, active low.
    fn sync_asc_irq(&mut self) {
        let level = !self.asc.irq_asserted();
        self.via2.set_cb1(level);
    }

    fn via1_port_out(&mut self, out: PortOut) {
        match out.port {
            Port::A => {
                let v = out.value;
                self.swim.iwm.sel = v & 0x20 != 0;
                if self.model == MacModel::Plus {
                    self.sound.set_volume(v & 0x07);
                    self.sound.select_buffer(v & 0x08 != 0);
                    self.video_alt = v & 0x40 == 0;
                }
                if v & 0x10 == 0 {
                    self.clear_overlay();
                }
            }
            Port::B => {
                let v = out.value;
                // RTC serial lines: data, clock, enable (active low).
                self.rtc.set_lines(v & 0x02 != 0, v & 0x01 != 0, v & 0x04 == 0);
                let data = self.rtc.data_line() as u8;
                self.via1.set_in_b(0x01, data);
                match self.model {
                    MacModel::Plus => {
                        self.sound.set_enabled(v & 0x80 == 0);
                    }
                    MacModel::SE30 => {
                        let st = (v >> 4) & 0x03;
                        if let Some(byte) = self.adb.set_state(st) {
                            self.via1.input_sr(byte);
                        }
                        let srq = self.adb.srq() as u8;
                        self.via1.set_in_b(0x08, srq << 3);
                    }
                }
            }
        }
    }

    // A byte finished shifting out of VIA 1: the keyboard hears commands on
    // the Plus, the ADB transceiver on the SE/30.
    fn route_shift_out(&mut self, byte: u8) {
        match self.model {
            MacModel::Plus => self.kbd.command(byte, &mut self.scheduler),
            MacModel::SE30 => {
                self.adb.shift_byte(byte);
                let srq = self.adb.srq() as u8;
                self.via1.set_in_b(0x08, srq << 3);
            }
        }
    }

    pub fn dispatch(&mut self, ev: Event) {
        match ev.kind {
            EventKind::ViaT1 { via: 0 } => self.via1.t1_expired(&mut self.scheduler),
            EventKind::ViaT1 { .. } => self.via2.t1_expired(&mut self.scheduler),
            EventKind::ViaT2 { via: 0 } => self.via1.t2_expired(),
            EventKind::ViaT2 { .. } => self.via2.t2_expired(),
            EventKind::ViaShift { via: 0 } => {
                if let Some(byte) = self.via1.shift_done() {
                    self.route_shift_out(byte);
                }
            }
            EventKind::ViaShift { .. } => {
                self.via2.shift_done();
            }
            EventKind::SccBrg { ch } => self.scc.brg_zero_count(ch as usize, &mut self.scheduler),
            EventKind::RtcTick => {
                self.rtc.tick(&mut self.scheduler);
                // One-second line pulses the VIA, high then low.
                self.via1.set_ca2(true);
                self.via1.set_ca2(false);
            }
            EventKind::IwmMotor { drive } => self.swim.iwm.motor_ready(drive as usize),
            EventKind::MouseX => {
                if let Some(step) = self.mouse.x_step(&mut self.scheduler) {
                    self.scc.set_dcd(CH_A, step.primary);
                    self.via1.set_in_b(0x10, (step.secondary as u8) << 4);
                }
            }
            EventKind::MouseY => {
                if let Some(step) = self.mouse.y_step(&mut self.scheduler) {
                    self.scc.set_dcd(CH_B, step.primary);
                    self.via1.set_in_b(0x20, (step.secondary as u8) << 5);
                }
            }
            EventKind::KbdReply => self.via1.input_sr(ev.data as u8),
            EventKind::KbdInquiryTimeout => self.kbd.inquiry_timeout(&mut self.scheduler),
        }
    }

    // OR of the asserted lines, as the glue logic presents it to the CPU:
    // VIA on level 1, SCC on level 2, VIA 2 alongside the SCC on the SE/30.
    pub fn irq_level(&self) -> u8 {
        let mut level = 0;
        if self.via1.irq_asserted() {
            level |= 1;
        }
        if self.scc.irq_asserted() {
            level |= 2;
        }
        if self.model == MacModel::SE30 && self.via2.irq_asserted() {
            level |= 2;
        }
        level
    }

    pub fn framebuffer_base(&self) -> usize {
        let main = self.map.ram_size() - VIDEO_MAIN_OFFSET;
        if self.video_alt && self.model == MacModel::Plus {
            main - VIDEO_ALT_EXTRA
        } else {
            main
        }
    }

    pub fn framebuffer(&self) -> &[u8] {
        let base = self.framebuffer_base();
        &self.map.ram()[base..base + FB_BYTES]
    }

    // Raise the vertical-blanking interrupt and pull the sound block for the
    // host. Returns the audio for the frame, if the model produces any here.
    pub fn trigger_vbl(&mut self) -> Option<(Vec<u8>, u8)> {
        self.via1.set_ca1(true);
        self.via1.set_ca1(false);
        match self.model {
            MacModel::Plus => {
                let block = self.sound.extract(self.map.ram());
                Some((block.to_vec(), self.sound.volume()))
            }
            MacModel::SE30 => {
                let mut samples = [0i16; SAMPLES_PER_VBL];
                self.asc.render(&mut samples);
                self.sync_asc_irq();
                let bytes: Vec<u8> =
                    samples.iter().map(|&s| ((s >> 8) as i8 as i16 + 128) as u8).collect();
                Some((bytes, 7))
            }
        }
    }
}

fn via_reg(addr: u32) -> usize {
    ((addr >> 9) & 0xF) as usize
}

fn promotes_wide(id: DeviceId) -> bool {
    match id {
        DeviceId::Via1 | DeviceId::Via2 => false,
        _ => true,
    }
}

pub struct Machine {
    pub bus: Bus,
    pub cpu: Box<dyn Cpu>,
    pub debugger: Debugger,
    pub audio: Option<Box<dyn AudioSink>>,
}

impl Machine {
    pub fn new(model: MacModel, rom: Vec<u8>) -> Result<Machine, Error> {
        let cpu = Box::new(crate::cpu::FreeRunCpu::new(0x40_0000));
        Machine::with_cpu(model, rom, cpu)
    }

    pub fn with_cpu(model: MacModel, rom: Vec<u8>, cpu: Box<dyn Cpu>) -> Result<Machine, Error> {
        if rom.is_empty() || rom.len() & (rom.len() - 1) != 0 {
            return Err(Error::RomSize { model: model.name(), size: rom.len() });
        }
        Ok(Machine {
            bus: Bus::new(model, rom, model.default_ram_size()),
            cpu,
            debugger: Debugger::new(),
            audio: None,
        })
    }

    pub fn set_audio_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.audio = Some(sink);
    }

    pub fn set_mode(&mut self, mode: SpeedMode) {
        self.bus.scheduler.set_mode(mode);
    }

    // The sprint loop. Plans a bounded batch against the next event, lets
    // the CPU burn it down, then drains everything that came due.
    pub fn run(&mut self, instructions: u64) -> u64 {
        let mut remaining = instructions;
        self.bus.scheduler.clear_stop();
        while remaining > 0 && !self.bus.scheduler.stopped() {
            let debugging = self.debugger.active();
            let planned = self.bus.scheduler.begin_sprint(remaining, debugging);
            if planned > 0 {
                self.cpu.run_sprint(&mut self.bus);
                let executed = self.bus.scheduler.end_sprint();
                remaining -= executed;
                if debugging && executed > 0 {
                    if self.debugger.break_and_trace(self.cpu.pc()) {
                        self.bus.scheduler.stop();
                    }
                }
                if executed == 0 {
                    // The engine refused to run; nothing will change.
                    break;
                }
            }
            while let Some(ev) = self.bus.scheduler.pop_due() {
                self.bus.dispatch(ev);
            }
            self.cpu.set_irq_level(self.bus.irq_level());
        }
        instructions - remaining
    }

    pub fn run_cycles(&mut self, cycles: u64) -> u64 {
        let cpi = self.bus.scheduler.cpi();
        self.run(cycles / cpi)
    }

    pub fn trigger_vbl(&mut self) {
        if let Some((samples, volume)) = self.bus.trigger_vbl() {
            if let Some(sink) = self.audio.as_mut() {
                sink.push(&samples, volume);
            }
        }
        self.cpu.set_irq_level(self.bus.irq_level());
    }

    // Host vsync entry point; paces VBLs per the speed mode.
    pub fn main_loop(&mut self, host_time: f64) {
        let vbls = self.bus.scheduler.main_loop(host_time);
        for _ in 0..vbls {
            self.trigger_vbl();
            self.run_cycles(VBL_PERIOD);
        }
    }

    pub fn framebuffer(&self) -> &[u8] {
        self.bus.framebuffer()
    }

    pub fn insert_floppy(&mut self, drive: usize, image: Box<dyn DiskImage>) -> Result<(), Error> {
        self.bus.swim.iwm.insert_disk(drive, image)
    }

    pub fn attach_scsi_disk(
        &mut self,
        id: u8,
        image: Box<dyn DiskImage>,
        vendor: &str,
        product: &str,
    ) -> Result<(), Error> {
        self.bus.scsi.attach_target(id, Target::new(image, vendor, product))
    }

    pub fn drive_state(&self, drive: usize) -> &DriveState {
        self.bus.swim.iwm.drive_state(drive)
    }

    pub fn key_event(&mut self, key: Key, down: bool) {
        match self.bus.model {
            MacModel::Plus => self.bus.kbd.key_event(key, down, &mut self.bus.scheduler),
            MacModel::SE30 => self.bus.adb.keyboard.key_event(adb_code(key), down),
        }
    }

    pub fn mouse_moved(&mut self, dx: i32, dy: i32) {
        match self.bus.model {
            MacModel::Plus => self.bus.mouse.move_by(dx, dy, &mut self.bus.scheduler),
            MacModel::SE30 => self.bus.adb.mouse.motion(dx, dy),
        }
    }

    pub fn mouse_button(&mut self, down: bool) {
        match self.bus.model {
            MacModel::Plus => {
                self.bus.mouse.set_button(down);
                let level = self.bus.mouse.button_level() as u8;
                self.bus.via1.set_in_b(0x08, level << 3);
            }
            MacModel::SE30 => self.bus.adb.mouse.set_button(down),
        }
    }

    // Inbound AppleTalk-style frame for SCC channel B.
    pub fn queue_serial_frame(&mut self, frame: &[u8]) {
        self.bus.scc.queue_frame(CH_B, frame);
    }

    pub fn flush_disks(&mut self) {
        self.bus.swim.iwm.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemImage;

    fn rom() -> Vec<u8> {
        let mut rom = vec![0u8; 0x20000];
        for (i, b) in rom.iter_mut().enumerate() {
            *b = (i ^ (i >> 8)) as u8;
        }
        rom
    }

    fn plus() -> Machine {
        Machine::new(MacModel::Plus, rom()).unwrap()
    }

    fn se30() -> Machine {
        Machine::new(MacModel::SE30, rom()).unwrap()
    }

    #[test]
    fn overlay_swaps_low_memory() {
        let mut m = plus();
        // At reset address zero reads ROM.
        assert_eq!(m.bus.read(0x0, Width::Byte), m.bus.read(0x40_0000, Width::Byte));
        // Clear the overlay bit: DDRA out, then port A with bit 4 low.
        m.bus.write(0xE80000 + (3 << 9), Width::Byte, 0xFF);
        m.bus.write(0xE80000 + (1 << 9), Width::Byte, 0x00);
        assert!(!m.bus.overlay);
        m.bus.write(0x0, Width::Long, 0xDEADBEEF);
        assert_eq!(m.bus.read(0x0, Width::Long), 0xDEADBEEF);
    }

    #[test]
    fn unmapped_reads_zero_and_writes_drop() {
        let mut m = plus();
        assert_eq!(m.bus.read(0x70_0000, Width::Long), 0);
        m.bus.write(0x70_0000, Width::Long, 0x12345678);
        assert_eq!(m.bus.read(0x70_0000, Width::Long), 0);
    }

    #[test]
    #[should_panic(expected = "wide access")]
    fn wide_via_access_aborts() {
        let mut m = plus();
        m.bus.read(0xE80000, Width::Word);
    }

    #[test]
    fn vbl_raises_via_ca1_interrupt() {
        let mut m = plus();
        m.bus.via1.write(crate::via::REG_PCR, 0x01, &mut m.bus.scheduler);
        m.bus.via1.write(crate::via::REG_IER, 0x80 | crate::via::IRQ_CA1, &mut m.bus.scheduler);
        assert_eq!(m.bus.irq_level(), 0);
        m.trigger_vbl();
        assert_eq!(m.bus.irq_level(), 1);
        assert_eq!(m.cpu.irq_level(), 1);
    }

    #[test]
    fn scheduler_basic_scenario() {
        // Schedule an event 1000 cycles out, run 500 instructions at CPI 4.
        let mut m = plus();
        m.set_mode(SpeedMode::RealTime);
        let before = m.bus.scheduler.cycles();
        m.bus.scheduler.schedule_cycles(EventKind::RtcTick, 0, 1000);
        let secs = m.bus.rtc.seconds();
        let ran = m.run(500);
        assert_eq!(ran, 500);
        assert_eq!(m.bus.scheduler.cycles() - before, 2000);
        // The tick fired exactly once.
        assert_eq!(m.bus.rtc.seconds(), secs + 1);
    }

    #[test]
    fn rtc_tick_reschedules_and_pulses_ca2() {
        let mut m = plus();
        m.bus.via1.write(crate::via::REG_PCR, 0x04, &mut m.bus.scheduler);
        m.bus.via1.write(crate::via::REG_IER, 0x80 | crate::via::IRQ_CA2, &mut m.bus.scheduler);
        let secs = m.bus.rtc.seconds();
        // One emulated second at CPI 4.
        m.run(crate::scheduler::CLOCK_HZ / 4 + 100);
        assert_eq!(m.bus.rtc.seconds(), secs + 1);
        assert_ne!(m.bus.irq_level() & 1, 0);
        assert!(m.bus.scheduler.is_scheduled(EventKind::RtcTick));
    }

    #[test]
    fn plus_keyboard_talks_over_the_shift_register() {
        let mut m = plus();
        let via = 0xE80000u32;
        // Shift out the INSTANT command.
        m.bus.write(via + (11 << 9), Width::Byte, 0x1C);
        m.bus.write(via + (10 << 9), Width::Byte, crate::keyboard::CMD_INSTANT as u32);
        // Shift completes, keyboard replies after its response delay.
        m.run(30_000);
        assert_eq!(m.bus.via1.sr_value(), crate::keyboard::REPLY_NULL);
    }

    #[test]
    fn adb_talk_through_via_wiring() {
        let mut m = se30();
        m.bus.adb.keyboard.key_event(0x0B, true);
        let via1 = 0x5000_0000u32;
        // Port B as outputs, shift register to output mode.
        m.bus.write(via1 + (2 << 9), Width::Byte, 0xFF);
        m.bus.write(via1 + (11 << 9), Width::Byte, 0x1C);
        // State = Cmd (ST bits 00), then send Talk R0 for address 2.
        m.bus.write(via1 + (0 << 9), Width::Byte, 0x00);
        m.bus.write(via1 + (10 << 9), Width::Byte, 0x2C);
        m.run(1000);
        // State = Even: first reply byte lands in the shift register.
        m.bus.write(via1 + (0 << 9), Width::Byte, 0x10);
        assert_eq!(m.bus.via1.sr_value(), 0x0B);
        // State = Odd: the 0xFF padding follows, SRQ still up.
        m.bus.write(via1 + (0 << 9), Width::Byte, 0x20);
        assert_eq!(m.bus.via1.sr_value(), 0xFF);
        // Next request drains to the dummy with SRQ low (PB3 reads 0).
        m.bus.write(via1 + (0 << 9), Width::Byte, 0x10);
        assert!(!m.bus.adb.srq());
    }

    #[test]
    fn quadrature_steps_reach_scc_and_via() {
        let mut m = plus();
        m.bus.scc.write(0x2, 0x09, &mut m.bus.scheduler); // WR9 via ch A
        m.bus.scc.write(0x2, 0x08, &mut m.bus.scheduler); // MIE
        // 6 host counts halve to 3 pulses, an odd number of DCD toggles.
        m.mouse_moved(6, 0);
        let before = m.bus.scc.dcd(CH_A);
        m.run(30_000);
        assert_ne!(m.bus.scc.dcd(CH_A), before);
    }

    #[test]
    fn framebuffer_is_one_bit_512_by_342() {
        let m = plus();
        assert_eq!(m.framebuffer().len(), FB_BYTES);
        let base = m.bus.framebuffer_base();
        assert_eq!(base, m.bus.map.ram_size() - 0x5900);
    }

    #[test]
    fn rom_size_must_be_a_power_of_two() {
        assert!(Machine::new(MacModel::Plus, vec![0; 0x12345]).is_err());
        assert!(Machine::new(MacModel::Plus, vec![]).is_err());
    }

    #[test]
    fn scsi_reachable_through_mmio() {
        let mut m = plus();
        let img = Box::new(MemImage::blank("hd.img", 512 * 100));
        m.attach_scsi_disk(0, img, "ACME", "DISK").unwrap();
        // ICR register read back through the bus.
        m.bus.write(0x580000 + 0x10, Width::Byte, 0x04);
        assert_eq!(m.bus.read(0x580000 + 0x10, Width::Byte), 0x04);
    }
}
