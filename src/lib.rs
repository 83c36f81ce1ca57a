// Hardware-level emulation of the classic 68000 Macintoshes (Plus and SE/30):
// the discrete-event scheduler, the memory map, and the peripheral chips --
// VIA, SCC, IWM/SWIM, SCSI, RTC, ASC, ADB, keyboard, mouse, sound -- plus
// checkpointing of the whole machine. The CPU itself plugs in behind the
// sprint trait in the cpu module; the mymac binary wires a window, audio and
// a debug shell around the core.

#[macro_use]
pub mod logging;

pub mod adb;
pub mod asc;
pub mod checkpoint;
pub mod cpu;
pub mod debugger;
pub mod disk;
pub mod error;
pub mod gcr;
pub mod iwm;
pub mod keyboard;
pub mod mac;
pub mod memory;
pub mod mouse;
pub mod rtc;
pub mod scc;
pub mod scheduler;
pub mod scsi;
pub mod sound;
pub mod swim;
pub mod via;

pub use crate::cpu::{Cpu, FreeRunCpu};
pub use crate::error::Error;
pub use crate::mac::{AudioSink, Bus, MacModel, Machine, FB_HEIGHT, FB_WIDTH};
pub use crate::scheduler::{SpeedMode, CLOCK_HZ, VBL_PERIOD};
