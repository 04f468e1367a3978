//! Capabilities supplied by the platform: register capture, watchdog, restart,
//! task enumeration and raw register reads.
//!
//! The engine never touches architecture state directly; it only sees the
//! structured values these traits return.

use exynos_ss_common::{CoreRegisters, MmuRegisters};

/// Architecture-specific CPU state capture.
pub trait CpuStateSnapshotter: Send + Sync {
    /// System control / MMU registers of `cpu`.
    fn save_system_registers(&self, cpu: usize) -> MmuRegisters;

    /// General purpose register frame of `cpu` at the point of the call.
    fn save_core_registers(&self, cpu: usize) -> CoreRegisters;

    /// Memory error syndrome registers, as `(name, value)`, where the CPU
    /// exposes them.
    fn error_syndromes(&self, _cpu: usize) -> Vec<(String, u64)> {
        Vec::new()
    }

    /// Write back and invalidate all data caches.
    fn flush_cache_all(&self) {}
}

/// Snapshotter for hosts without register access. Captures nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshotter;

impl CpuStateSnapshotter for NoopSnapshotter {
    fn save_system_registers(&self, _cpu: usize) -> MmuRegisters {
        MmuRegisters::default()
    }

    fn save_core_registers(&self, _cpu: usize) -> CoreRegisters {
        CoreRegisters::default()
    }
}

/// One row of the task table dumped on panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: i32,
    pub comm: String,
    /// Scheduler state letter (R, S, D, ...).
    pub state: char,
    pub cpu: usize,
    pub pc: u64,
    pub exec_start_ns: u64,
}

/// Kernel and SoC services consumed by crash capture and the hooks.
/// Every method has an inert default.
pub trait PlatformHooks: Send + Sync {
    /// Disable local interrupts, returning the previous state.
    fn irq_save(&self) -> u64 {
        0
    }

    fn irq_restore(&self, _flags: u64) {}

    fn watchdog_keepalive(&self) {}

    fn watchdog_emergency_reset(&self, _timeout_ms: u32) {}

    /// Hand over to the platform restart path.
    fn restart(&self, _reason: &str) {}

    /// Park `cpu` forever. Real implementations do not return.
    fn stall_cpu(&self, _cpu: usize) {}

    fn online_cpus(&self) -> usize {
        1
    }

    fn tasks(&self) -> Vec<TaskInfo> {
        Vec::new()
    }

    /// Read a 32-bit special function register by physical address.
    fn read_sfr(&self, _paddr: u64) -> Option<u32> {
        None
    }

    /// Ask the secure world to dump its own state.
    fn dump_secure_region(&self) {}

    /// Last program counters sampled by the debug core of `cpu`.
    fn last_pcs(&self, _cpu: usize) -> Option<[u64; 5]> {
        None
    }

    fn virt_to_phys(&self, vaddr: u64) -> u64 {
        vaddr
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlatform;

impl PlatformHooks for NullPlatform {}

/// Local interrupts stay disabled while this is alive.
pub(crate) struct IrqGuard<'a> {
    platform: &'a dyn PlatformHooks,
    flags: u64,
}

impl<'a> IrqGuard<'a> {
    pub(crate) fn new(platform: &'a dyn PlatformHooks) -> Self {
        let flags = platform.irq_save();
        Self { platform, flags }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.platform.irq_restore(self.flags);
    }
}
