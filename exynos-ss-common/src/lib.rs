#![cfg_attr(all(feature = "bare", not(feature = "user")), no_std)]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// SNAPSHOT REGION - Shared Layout Definitions
// =============================================================================
//
// Everything in this crate describes bytes that live inside the reserved
// snapshot region. The writer (exynos-ss) and any offline reader (ess-dump,
// bootloader tooling) must agree on these layouts bit for bit.
//
// REGION LAYOUT (log_kevents item, always placed first):
//   [0x0000..0x0100] HeaderBase      - vaddr/paddr/size/magic
//   [0x0100]         scratch sign
//   [0x0200]         last logbuf pointer
//   [0x0300]         emergency reason
//   [0x0400]         per-CPU core power stat (u32 each)
//   [0x0500]         per-CPU core panic stat (u32 each)
//   [0x0600]         ItemDescriptor table
//   [0x0C00]         panic string (1024 bytes)
//   [0x1000]         per-CPU MmuRegisters, 512-byte stride
//   [0x2000]         per-CPU CoreRegisters, 512-byte stride
//   [0x3000]         spare area (16K)
//   [0x7000]         KeventsDirectory + DirectoryEntry[] + indices + rings
//
// Everything past KEEP_SIZE is cleared on every boot.
// =============================================================================

/// Maximum number of CPUs with their own shard / header slot.
pub const MAX_CPUS: usize = 8;

/// Maximum callstack depth stored per record.
pub const CALLSTACK_MAX: usize = 4;

/// Maximum number of named items in the region.
pub const ITEM_MAX: usize = 10;

/// Length of the printk mirror text.
pub const LOG_STRING_LEN: usize = 128;

/// Magic stored in `HeaderBase::magic`.
pub const HEADER_MAGIC: u64 = 0xDBDB_DBDB;

/// Magic stored at the start of the kevents ring directory ("KEVS").
pub const KEVENTS_MAGIC: u32 = 0x5356_454B;
pub const KEVENTS_VERSION: u32 = 1;

/// Fixed offsets inside the header block.
pub mod header {
    pub const BASE: usize = 0x000;
    pub const SCRATCH: usize = 0x100;
    pub const LAST_LOGBUF: usize = 0x200;
    pub const EMERGENCY_REASON: usize = 0x300;
    pub const CORE_POWER_STAT: usize = 0x400;
    pub const CORE_PANIC_STAT: usize = 0x500;
    pub const ITEM_TABLE: usize = 0x600;
    pub const PANIC_STRING: usize = 0xC00;
    pub const MMU_REG: usize = 0x1000;
    pub const CORE_REG: usize = 0x2000;
    pub const SPARE: usize = 0x3000;

    /// Bytes at the start of the header that survive re-initialisation.
    pub const KEEP_SIZE: usize = 256 * 3;
    pub const PANIC_STRING_LEN: usize = 1024;
    /// Stride between per-CPU register slots.
    pub const REG_STRIDE: usize = 512;
    pub const SPARE_SIZE: usize = 16 * 1024;

    /// header + mmu regs + core regs + spare
    pub const TOTAL_SIZE: usize = 0x1000 + 0x1000 + 0x1000 + SPARE_SIZE;
    /// Allocation used when the kevents item is configured off and
    /// only carries the header.
    pub const ALLOC_SIZE: usize = 2 * 1024 * 1024;
}

/// Sentinel signatures written into the header.
pub mod sign {
    pub const RESET: u32 = 0x0;
    pub const RESERVED: u32 = 0x1;
    pub const SCRATCH: u32 = 0xD;
    pub const ALIVE: u32 = 0xFACE;
    pub const DEAD: u32 = 0xDEAD;
    pub const PANIC: u32 = 0xBABA;
    pub const SAFE_FAULT: u32 = 0xFAFA;
    pub const NORMAL_REBOOT: u32 = 0xCAFE;
    pub const FORCE_REBOOT: u32 = 0xDAFE;

    /// Human readable name for a sentinel, for tooling output.
    pub fn name(value: u32) -> &'static str {
        match value {
            RESET => "RESET",
            RESERVED => "RESERVED",
            SCRATCH => "SCRATCH",
            ALIVE => "ALIVE",
            DEAD => "DEAD",
            PANIC => "PANIC",
            SAFE_FAULT => "SAFE_FAULT",
            NORMAL_REBOOT => "NORMAL_REBOOT",
            FORCE_REBOOT => "FORCE_REBOOT",
            _ => "UNKNOWN",
        }
    }
}

/// Item descriptor flag bits.
pub mod item_flags {
    pub const ENABLED: u32 = 1 << 0;
    pub const PERSIST: u32 = 1 << 1;
}

/// Self-describing record at offset 0 of the region.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct HeaderBase {
    pub vaddr: u64,
    pub paddr: u64,
    pub size: u64,
    pub magic: u64,
}

/// One entry of the item table at `header::ITEM_TABLE`.
/// A zeroed name terminates the table.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ItemDescriptor {
    pub name: [u8; 16],
    pub paddr: u64,
    pub size: u64,
    pub flags: u32,
    pub _pad: u32,
}

/// Per-CPU system (MMU) register snapshot.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct MmuRegisters {
    pub sctlr: u64,
    pub ttbr0: u64,
    pub ttbr1: u64,
    pub tcr: u64,
    pub esr: u64,
    pub far: u64,
    pub contextidr: u64,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,
    pub tpidr_el1: u64,
    pub mair: u64,
    pub elr: u64,
    pub sp_el0: u64,
}

/// Per-CPU general purpose register frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CoreRegisters {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl Default for CoreRegisters {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Header of the ring directory at `header::TOTAL_SIZE`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct KeventsDirectory {
    pub magic: u32,
    pub version: u32,
    pub count: u32,
    pub _pad: u32,
}

/// Placement of one category's rings inside the kevents item.
/// Offsets are relative to the start of the kevents item.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct DirectoryEntry {
    pub category: u32,
    pub shards: u32,
    pub capacity: u32,
    pub record_size: u32,
    /// `shards` signed 64-bit write indices
    pub index_offset: u64,
    /// `shards * capacity` records, shard-major
    pub data_offset: u64,
}

/// Entry/exit marker stored in the `en` field of records.
pub mod direction {
    pub const IN: u32 = 1;
    pub const ON: u32 = 2;
    pub const OUT: u32 = 3;

    pub fn label(en: u32) -> &'static str {
        match en {
            IN => "IN",
            ON => "ON",
            _ => "OUT",
        }
    }
}

// =============================================================================
// CATEGORIES
// =============================================================================

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Category {
    Task = 0,
    Work = 1,
    Cpuidle = 2,
    Suspend = 3,
    Irq = 4,
    IrqExit = 5,
    Spinlock = 6,
    IrqsDisabled = 7,
    Reg = 8,
    Hrtimer = 9,
    Clockevent = 10,
    Clk = 11,
    Pmu = 12,
    Freq = 13,
    Dm = 14,
    Regulator = 15,
    Thermal = 16,
    Acpm = 17,
    I2c = 18,
    Spi = 19,
    Printkl = 20,
    Printk = 21,
    Core = 22,
}

impl Category {
    pub const COUNT: usize = 23;

    pub const ALL: [Category; Category::COUNT] = [
        Category::Task,
        Category::Work,
        Category::Cpuidle,
        Category::Suspend,
        Category::Irq,
        Category::IrqExit,
        Category::Spinlock,
        Category::IrqsDisabled,
        Category::Reg,
        Category::Hrtimer,
        Category::Clockevent,
        Category::Clk,
        Category::Pmu,
        Category::Freq,
        Category::Dm,
        Category::Regulator,
        Category::Thermal,
        Category::Acpm,
        Category::I2c,
        Category::Spi,
        Category::Printkl,
        Category::Printk,
        Category::Core,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Category::Task => "task",
            Category::Work => "work",
            Category::Cpuidle => "cpuidle",
            Category::Suspend => "suspend",
            Category::Irq => "irq",
            Category::IrqExit => "irq_exit",
            Category::Spinlock => "spinlock",
            Category::IrqsDisabled => "irqs_disabled",
            Category::Reg => "reg",
            Category::Hrtimer => "hrtimer",
            Category::Clockevent => "clockevent",
            Category::Clk => "clk",
            Category::Pmu => "pmu",
            Category::Freq => "freq",
            Category::Dm => "dm",
            Category::Regulator => "regulator",
            Category::Thermal => "thermal",
            Category::Acpm => "acpm",
            Category::I2c => "i2c",
            Category::Spi => "spi",
            Category::Printkl => "printkl",
            Category::Printk => "printk",
            Category::Core => "core",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Per-CPU categories get one ring (and one index) per CPU.
    pub const fn per_cpu(self) -> bool {
        matches!(
            self,
            Category::Task
                | Category::Work
                | Category::Cpuidle
                | Category::Irq
                | Category::IrqExit
                | Category::Spinlock
                | Category::IrqsDisabled
                | Category::Reg
                | Category::Hrtimer
                | Category::Clockevent
                | Category::Core
        )
    }

    /// Ring capacity used when the configuration does not override it.
    pub const fn default_capacity(self) -> usize {
        match self {
            Category::Irq | Category::Printkl | Category::Printk => 2048,
            Category::Suspend => 4096,
            Category::IrqsDisabled => 32,
            Category::Core => 1,
            _ => 1024,
        }
    }

    pub const fn record_size(self) -> usize {
        match self {
            Category::Task => core::mem::size_of::<TaskLog>(),
            Category::Work => core::mem::size_of::<WorkLog>(),
            Category::Cpuidle => core::mem::size_of::<CpuidleLog>(),
            Category::Suspend => core::mem::size_of::<SuspendLog>(),
            Category::Irq => core::mem::size_of::<IrqLog>(),
            Category::IrqExit => core::mem::size_of::<IrqExitLog>(),
            Category::Spinlock => core::mem::size_of::<SpinlockLog>(),
            Category::IrqsDisabled => core::mem::size_of::<IrqsDisabledLog>(),
            Category::Reg => core::mem::size_of::<RegLog>(),
            Category::Hrtimer => core::mem::size_of::<HrtimerLog>(),
            Category::Clockevent => core::mem::size_of::<ClockeventLog>(),
            Category::Clk => core::mem::size_of::<ClkLog>(),
            Category::Pmu => core::mem::size_of::<PmuLog>(),
            Category::Freq => core::mem::size_of::<FreqLog>(),
            Category::Dm => core::mem::size_of::<DmLog>(),
            Category::Regulator => core::mem::size_of::<RegulatorLog>(),
            Category::Thermal => core::mem::size_of::<ThermalLog>(),
            Category::Acpm => core::mem::size_of::<AcpmLog>(),
            Category::I2c => core::mem::size_of::<I2cLog>(),
            Category::Spi => core::mem::size_of::<SpiLog>(),
            Category::Printkl => core::mem::size_of::<PrintklLog>(),
            Category::Printk => core::mem::size_of::<PrintkLog>(),
            Category::Core => core::mem::size_of::<CoreLog>(),
        }
    }
}

/// A fixed-shape record stored in one category's ring.
pub trait LogRecord: Pod {
    const CATEGORY: Category;

    /// Monotonic timestamp in nanoseconds.
    fn time(&self) -> u64;
}

macro_rules! log_record {
    ($ty:ty, $cat:expr) => {
        impl LogRecord for $ty {
            const CATEGORY: Category = $cat;

            #[inline(always)]
            fn time(&self) -> u64 {
                self.time
            }
        }
    };
}

// =============================================================================
// RECORD SHAPES
// =============================================================================
//
// All records are repr(C) without implicit padding so they can be read back
// byte for byte from a preserved image. Every record starts with `time`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct TaskLog {
    pub time: u64,
    pub sp: u64,
    pub task: u64,
    pub comm: [u8; 16],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WorkLog {
    pub time: u64,
    pub sp: u64,
    pub worker: u64,
    pub func: u64,
    pub comm: [u8; 16],
    pub en: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CpuidleLog {
    pub time: u64,
    pub sp: u64,
    pub modes: [u8; 16],
    pub state: u32,
    pub num_online_cpus: u32,
    /// stay time in the state, microseconds
    pub delta: u32,
    pub en: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SuspendLog {
    pub time: u64,
    pub sp: u64,
    pub func: u64,
    pub dev: u64,
    pub en: u32,
    pub core: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct IrqLog {
    pub time: u64,
    pub sp: u64,
    pub func: u64,
    pub irq: u32,
    pub preempt: u32,
    pub val: u32,
    pub en: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct IrqExitLog {
    /// handler start
    pub time: u64,
    pub end_time: u64,
    pub latency: u64,
    pub irq: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SpinlockLog {
    pub time: u64,
    pub sp: u64,
    pub jiffies: u64,
    pub task: u64,
    pub magic: u32,
    pub owner_cpu: u32,
    pub next: u16,
    pub owner: u16,
    pub en: u32,
    pub caller: [u64; CALLSTACK_MAX],
    pub comm: [u8; 16],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct IrqsDisabledLog {
    pub time: u64,
    pub index: u64,
    pub task: u64,
    pub comm: [u8; 16],
    pub caller: [u64; CALLSTACK_MAX],
    pub en: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RegLog {
    pub time: u64,
    pub val: u64,
    pub reg: u64,
    pub read: u32,
    pub en: u32,
    pub caller: [u64; CALLSTACK_MAX],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct HrtimerLog {
    pub time: u64,
    pub now: u64,
    pub timer: u64,
    pub func: u64,
    pub en: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ClockeventLog {
    pub time: u64,
    pub mct_cycle: u64,
    pub delta_ns: i64,
    pub next_event: i64,
    pub caller: [u64; CALLSTACK_MAX],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ClkLog {
    pub time: u64,
    pub clk: u64,
    pub arg: u64,
    pub clk_name: [u8; 24],
    pub func: u64,
    pub mode: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PmuLog {
    pub time: u64,
    pub func: u64,
    pub id: u32,
    pub mode: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct FreqLog {
    pub time: u64,
    pub old_freq: u64,
    pub target_freq: u64,
    pub name: [u8; 8],
    pub domain: u32,
    pub cpu: u32,
    pub en: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DmLog {
    pub time: u64,
    pub min_freq: u64,
    pub max_freq: u64,
    pub cpu: u32,
    pub dm_num: u32,
    pub wait_dmt: i32,
    pub do_dmt: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RegulatorLog {
    pub time: u64,
    pub name: [u8; 16],
    pub cpu: u32,
    pub reg: u32,
    pub voltage: u32,
    pub en: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ThermalLog {
    pub time: u64,
    pub data: u64,
    pub cooling_device: [u8; 16],
    pub cpu: u32,
    pub temp: u32,
    pub cooling_state: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct AcpmLog {
    pub time: u64,
    pub acpm_time: u64,
    /// 9 significant bytes, NUL terminated
    pub log: [u8; 16],
    pub data: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct I2cLog {
    pub time: u64,
    pub adap: u64,
    pub msgs: u64,
    pub cpu: u32,
    pub num: i32,
    pub en: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SpiLog {
    pub time: u64,
    pub master: u64,
    pub cur_msg: u64,
    pub cpu: u32,
    pub en: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PrintklLog {
    pub time: u64,
    pub msg: u64,
    pub val: u64,
    pub cpu: u32,
    pub _pad: u32,
    pub caller: [u64; CALLSTACK_MAX],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PrintkLog {
    pub time: u64,
    pub log: [u8; LOG_STRING_LEN],
    pub cpu: u32,
    pub _pad: u32,
    pub caller: [u64; CALLSTACK_MAX],
}

/// Last program counters sampled on a CPU at panic time.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CoreLog {
    pub time: u64,
    pub last_pc: [u64; 5],
}

log_record!(TaskLog, Category::Task);
log_record!(WorkLog, Category::Work);
log_record!(CpuidleLog, Category::Cpuidle);
log_record!(SuspendLog, Category::Suspend);
log_record!(IrqLog, Category::Irq);
log_record!(IrqExitLog, Category::IrqExit);
log_record!(SpinlockLog, Category::Spinlock);
log_record!(IrqsDisabledLog, Category::IrqsDisabled);
log_record!(RegLog, Category::Reg);
log_record!(HrtimerLog, Category::Hrtimer);
log_record!(ClockeventLog, Category::Clockevent);
log_record!(ClkLog, Category::Clk);
log_record!(PmuLog, Category::Pmu);
log_record!(FreqLog, Category::Freq);
log_record!(DmLog, Category::Dm);
log_record!(RegulatorLog, Category::Regulator);
log_record!(ThermalLog, Category::Thermal);
log_record!(AcpmLog, Category::Acpm);
log_record!(I2cLog, Category::I2c);
log_record!(SpiLog, Category::Spi);
log_record!(PrintklLog, Category::Printkl);
log_record!(PrintkLog, Category::Printk);
log_record!(CoreLog, Category::Core);

// =============================================================================
// FIXED STRING HELPERS
// =============================================================================

/// Copy `src` into a fixed buffer, truncating and always leaving a NUL.
pub fn copy_str(dst: &mut [u8], src: &str) {
    if dst.is_empty() {
        return;
    }
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    dst[n..].fill(0);
}

/// Read a NUL terminated fixed buffer back as text. Invalid UTF-8 is cut at
/// the first bad byte.
pub fn str_from_bytes(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let bytes = &bytes[..end];
    match core::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or(""),
    }
}

#[cfg(test)]
const _: () = {
    assert!(size_of::<HeaderBase>() == 32);
    assert!(size_of::<ItemDescriptor>() == 40);
    assert!(size_of::<DirectoryEntry>() == 32);
    assert!(size_of::<MmuRegisters>() <= header::REG_STRIDE);
    assert!(size_of::<CoreRegisters>() <= header::REG_STRIDE);
    assert!(ITEM_MAX * size_of::<ItemDescriptor>() <= header::PANIC_STRING - header::ITEM_TABLE);
};
