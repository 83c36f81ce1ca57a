// mymac: native front end for the emulator core. Windowed mode blits the
// 1-bit framebuffer into a minifb window at the host vsync and feeds PWM
// blocks to a rodio sink; shell mode trades the window for a line debugger
// with breakpoints, tracing and checkpoints.

use emmac::checkpoint::{self, CheckpointStore};
use emmac::disk::FileImage;
use emmac::keyboard::Key;
use emmac::logging::{self, Cat};
use emmac::{AudioSink, FreeRunCpu, MacModel, Machine, SpeedMode, FB_HEIGHT, FB_WIDTH, VBL_PERIOD};
use minifb::{Window, WindowOptions};
use std::collections::HashSet;
use std::io::{self, Write as IoWrite};
use std::path::Path;
use std::time::{Duration, Instant};
use termion::color;

const AUDIO_RATE: u32 = 22_255;

struct RodioSink {
    _stream: rodio::OutputStream,
    sink: rodio::Sink,
}

impl RodioSink {
    fn new() -> Option<RodioSink> {
        let (stream, handle) = rodio::OutputStream::try_default().ok()?;
        let sink = rodio::Sink::try_new(&handle).ok()?;
        Some(RodioSink { _stream: stream, sink })
    }
}

impl AudioSink for RodioSink {
    fn push(&mut self, samples: &[u8], volume: u8) {
        let scale = volume as f32 / 7.0 / 128.0;
        let data: Vec<f32> = samples.iter().map(|&b| (b as f32 - 128.0) * scale).collect();
        self.sink.append(rodio::buffer::SamplesBuffer::new(1, AUDIO_RATE, data));
    }
}

struct Options {
    rom: String,
    model: MacModel,
    floppy: Option<String>,
    scsi: Option<String>,
    shell: bool,
    checkpoints: String,
}

fn usage() -> ! {
    eprintln!("usage: mymac [--se30] [--shell] [--floppy IMG] [--scsi IMG] [--checkpoints DIR] ROM");
    std::process::exit(2);
}

fn parse_args() -> Options {
    let mut opts = Options {
        rom: String::new(),
        model: MacModel::Plus,
        floppy: None,
        scsi: None,
        shell: false,
        checkpoints: "checkpoints".to_string(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--se30" => opts.model = MacModel::SE30,
            "--shell" => opts.shell = true,
            "--floppy" => opts.floppy = args.next().or_else(|| usage()),
            "--scsi" => opts.scsi = args.next().or_else(|| usage()),
            "--checkpoints" => opts.checkpoints = args.next().unwrap_or_else(|| usage()),
            _ if opts.rom.is_empty() => opts.rom = arg,
            _ => usage(),
        }
    }
    if opts.rom.is_empty() {
        usage();
    }
    opts
}

fn build_machine(opts: &Options) -> Machine {
    let rom = std::fs::read(&opts.rom).expect("ROM image does not exist!");
    let cpu = Box::new(FreeRunCpu::with_fetch(match opts.model {
        MacModel::Plus => 0x40_0000,
        MacModel::SE30 => 0x4000_0000,
    }));
    let mut machine = Machine::with_cpu(opts.model, rom, cpu).expect("ROM does not fit the model!");
    if let Some(path) = &opts.floppy {
        let image = FileImage::open(path, true).expect("Floppy image does not exist!");
        machine.insert_floppy(0, Box::new(image)).expect("Drive refused the image!");
    }
    if let Some(path) = &opts.scsi {
        let image = FileImage::open(path, true).expect("Disk image does not exist!");
        machine.attach_scsi_disk(0, Box::new(image), "EMMAC", "DISK").expect("Bad SCSI setup!");
    }
    machine
}

fn map_key(key: minifb::Key) -> Option<Key> {
    use minifb::Key as K;
    Some(match key {
        K::A => Key::A, K::B => Key::B, K::C => Key::C, K::D => Key::D, K::E => Key::E,
        K::F => Key::F, K::G => Key::G, K::H => Key::H, K::I => Key::I, K::J => Key::J,
        K::K => Key::K, K::L => Key::L, K::M => Key::M, K::N => Key::N, K::O => Key::O,
        K::P => Key::P, K::Q => Key::Q, K::R => Key::R, K::S => Key::S, K::T => Key::T,
        K::U => Key::U, K::V => Key::V, K::W => Key::W, K::X => Key::X, K::Y => Key::Y,
        K::Z => Key::Z,
        K::Key0 => Key::Num0, K::Key1 => Key::Num1, K::Key2 => Key::Num2,
        K::Key3 => Key::Num3, K::Key4 => Key::Num4, K::Key5 => Key::Num5,
        K::Key6 => Key::Num6, K::Key7 => Key::Num7, K::Key8 => Key::Num8,
        K::Key9 => Key::Num9,
        K::Space => Key::Space, K::Enter => Key::Return, K::Tab => Key::Tab,
        K::Backspace => Key::Backspace,
        K::Minus => Key::Minus, K::Equal => Key::Equal,
        K::LeftBracket => Key::LeftBracket, K::RightBracket => Key::RightBracket,
        K::Backslash => Key::Backslash, K::Semicolon => Key::Semicolon,
        K::Apostrophe => Key::Quote, K::Comma => Key::Comma, K::Period => Key::Period,
        K::Slash => Key::Slash,
        K::LeftShift | K::RightShift => Key::Shift,
        K::LeftCtrl | K::RightCtrl => Key::Command,
        K::LeftAlt | K::RightAlt => Key::Option,
        K::CapsLock => Key::CapsLock,
        K::Left => Key::Left, K::Right => Key::Right, K::Up => Key::Up, K::Down => Key::Down,
        _ => return None,
    })
}

fn run_window(mut machine: Machine) {
    let mut window = Window::new(
        "mymac - ESC to exit",
        FB_WIDTH,
        FB_HEIGHT,
        WindowOptions::default(),
    )
    .unwrap_or_else(|e| {
        panic!("{}", e);
    });
    window.limit_update_rate(Some(Duration::from_micros(16_625)));
    if let Some(sink) = RodioSink::new() {
        machine.set_audio_sink(Box::new(sink));
    } else {
        println!("No audio device, running silent.");
    }
    let start = Instant::now();
    let mut buffer = vec![0u32; FB_WIDTH * FB_HEIGHT];
    let mut held: HashSet<minifb::Key> = HashSet::new();
    let mut last_mouse: Option<(f32, f32)> = None;
    let mut last_button = false;
    while window.is_open() && !window.is_key_down(minifb::Key::Escape) {
        machine.main_loop(start.elapsed().as_secs_f64());

        let keys: HashSet<minifb::Key> =
            window.get_keys().unwrap_or_default().into_iter().collect();
        let pressed: Vec<minifb::Key> = keys.difference(&held).copied().collect();
        let released: Vec<minifb::Key> = held.difference(&keys).copied().collect();
        for k in pressed {
            if let Some(key) = map_key(k) {
                machine.key_event(key, true);
            }
        }
        for k in released {
            if let Some(key) = map_key(k) {
                machine.key_event(key, false);
            }
        }
        held = keys;

        if let Some((x, y)) = window.get_mouse_pos(minifb::MouseMode::Pass) {
            if let Some((lx, ly)) = last_mouse {
                let dx = (x - lx) as i32;
                let dy = (y - ly) as i32;
                if dx != 0 || dy != 0 {
                    machine.mouse_moved(dx, dy);
                }
            }
            last_mouse = Some((x, y));
        }
        let button = window.get_mouse_down(minifb::MouseButton::Left);
        if button != last_button {
            machine.mouse_button(button);
            last_button = button;
        }

        let fb = machine.framebuffer();
        for (i, &byte) in fb.iter().enumerate() {
            for bit in 0..8 {
                // MSB is the leftmost pixel, 1 is black.
                let px = if byte & (0x80 >> bit) != 0 { 0x0 } else { 0xFFFFFF };
                buffer[8 * i + bit] = px;
            }
        }
        window.update_with_buffer(&buffer, FB_WIDTH, FB_HEIGHT).expect("Error updating screen!");
    }
    machine.flush_disks();
}

fn run_shell(mut machine: Machine, opts: &Options) {
    let store = CheckpointStore::new(Path::new(&opts.checkpoints)).expect("checkpoint dir");
    let mut seq: u64 = store.latest().map(|(s, _)| s + 1).unwrap_or(1);
    println!("{} ready. Type 'help' for commands.", machine.bus.model.name());
    loop {
        print!("{}mymac>{} ", color::Fg(color::Green), color::Fg(color::Reset));
        io::stdout().flush().expect("");
        let mut input = String::new();
        if io::stdin().read_line(&mut input).unwrap_or(0) == 0 {
            break;
        }
        let mut cmd = input.split_whitespace();
        match cmd.next() {
            Some("q") | Some("quit") => break,
            Some("help") => {
                println!("run [N]    execute N instructions (default one VBL)");
                println!("vbl        trigger a VBL and run one frame");
                println!("s          single step");
                println!("b ADDR     set breakpoint (hex)");
                println!("d ADDR     delete breakpoint");
                println!("trace on|off|show");
                println!("mode max|real|hw");
                println!("log CAT LEVEL (error..trace)");
                println!("ckpt save|load");
                println!("pc         show program counter");
            }
            Some("run") => {
                let n = cmd.next().and_then(|s| s.parse().ok()).unwrap_or(VBL_PERIOD / 4);
                let ran = machine.run(n);
                println!("ran {} instructions, cycle {}", ran, machine.bus.scheduler.cycles());
            }
            Some("vbl") => {
                machine.trigger_vbl();
                machine.run_cycles(VBL_PERIOD);
                println!("cycle {}", machine.bus.scheduler.cycles());
            }
            Some("s") => {
                machine.run(1);
                println!("pc {:08x}", machine.cpu.pc());
            }
            Some("b") => match cmd.next().and_then(|s| u32::from_str_radix(s, 16).ok()) {
                Some(addr) => {
                    machine.debugger.add_breakpoint(addr);
                    println!("Breakpoint created.");
                }
                None => println!("Invalid address!"),
            },
            Some("d") => match cmd.next().and_then(|s| u32::from_str_radix(s, 16).ok()) {
                Some(addr) => {
                    machine.debugger.remove_breakpoint(addr);
                    println!("Breakpoint deleted.");
                }
                None => println!("Invalid address!"),
            },
            Some("trace") => match cmd.next() {
                Some("on") => machine.debugger.set_tracing(true),
                Some("off") => machine.debugger.set_tracing(false),
                Some("show") => {
                    for line in machine.debugger.show(&|pc| format!("dc.w ${:04x}", pc & 0xFFFF)) {
                        println!("{}", line);
                    }
                }
                _ => println!("trace on|off|show"),
            },
            Some("mode") => match cmd.next() {
                Some("max") => machine.set_mode(SpeedMode::MaxSpeed),
                Some("real") => machine.set_mode(SpeedMode::RealTime),
                Some("hw") => machine.set_mode(SpeedMode::HardwareAccuracy),
                _ => println!("mode max|real|hw"),
            },
            Some("log") => {
                let cat = cmd.next().and_then(Cat::from_name);
                let level = cmd.next().and_then(|s| match s {
                    "error" => Some(log::Level::Error),
                    "warn" => Some(log::Level::Warn),
                    "info" => Some(log::Level::Info),
                    "debug" => Some(log::Level::Debug),
                    "trace" => Some(log::Level::Trace),
                    _ => None,
                });
                match (cat, level) {
                    (Some(c), Some(l)) => logging::set_level(c, l),
                    _ => println!("log CAT error|warn|info|debug|trace"),
                }
            }
            Some("ckpt") => match cmd.next() {
                Some("save") => match checkpoint::save(&machine) {
                    Ok(bytes) => {
                        match store.save(seq, &bytes) {
                            Ok(path) => {
                                println!("checkpoint {} -> {}", seq, path.display());
                                seq += 1;
                            }
                            Err(e) => println!("save failed: {}", e),
                        }
                    }
                    Err(e) => println!("snapshot failed: {}", e),
                },
                Some("load") => match store.load_latest() {
                    Ok(Some((n, bytes))) => {
                        let rom = std::fs::read(&opts.rom).expect("ROM image does not exist!");
                        match checkpoint::restore(&bytes, rom, Box::new(FreeRunCpu::new(0))) {
                            Ok(m) => {
                                machine = m;
                                println!("restored checkpoint {}", n);
                            }
                            Err(e) => println!("restore failed: {}", e),
                        }
                    }
                    Ok(None) => println!("no checkpoints"),
                    Err(e) => println!("load failed: {}", e),
                },
                _ => println!("ckpt save|load"),
            },
            Some("pc") => println!("pc {:08x}", machine.cpu.pc()),
            Some(other) => println!("Unknown command '{}'.", other),
            None => {}
        }
    }
    machine.flush_disks();
}

fn main() {
    env_logger::init();
    let opts = parse_args();
    let machine = build_machine(&opts);
    if opts.shell {
        run_shell(machine, &opts);
    } else {
        run_window(machine);
    }
}
