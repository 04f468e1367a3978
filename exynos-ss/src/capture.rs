//! Crash capture: per-CPU register snapshots guarded by the panic stat, the
//! panic and reboot notifier bodies, and the lifecycle hooks exported to
//! other drivers.

use exynos_ss_common::{CoreRegisters, MAX_CPUS, sign};
use log::{error, info};

use crate::context::DiagnosticsContext;
use crate::error::{Result, SnapshotError};
use crate::platform::IrqGuard;

const EMERGENCY_RESET_MS: u32 = 100;

/// What [`DiagnosticsContext::save_context`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Registers written and the CPU marked as captured.
    Captured,
    /// The CPU was already captured; nothing was written.
    Skipped,
    /// Framework disabled or CPU out of range.
    Disabled,
}

impl DiagnosticsContext {
    /// Snapshot `cpu`'s system and core registers into its header slots.
    ///
    /// `regs` is the faulting frame when the caller has one; otherwise the
    /// snapshotter captures the current frame. Only the first call per CPU
    /// captures; later calls return [`CaptureOutcome::Skipped`] until the
    /// panic stat is reset by [`DiagnosticsContext::post_reboot`].
    pub fn save_context(&self, cpu: usize, regs: Option<&CoreRegisters>) -> CaptureOutcome {
        let Some(hdr) = self.live_header() else {
            return CaptureOutcome::Disabled;
        };
        if cpu >= MAX_CPUS {
            return CaptureOutcome::Disabled;
        }
        let _irqs_off = IrqGuard::new(&*self.platform);

        if hdr.core_panic_stat(cpu) == sign::PANIC {
            self.stats.inc_capture_skipped();
            info!("exynos-snapshot: skip context saved(CPU:{cpu})");
            return CaptureOutcome::Skipped;
        }

        hdr.set_mmu_registers(cpu, self.snapshotter.save_system_registers(cpu));
        let core = match regs {
            Some(regs) => *regs,
            None => self.snapshotter.save_core_registers(cpu),
        };
        hdr.set_core_registers(cpu, core);
        hdr.set_core_panic_stat(cpu, sign::PANIC);
        for (name, value) in self.snapshotter.error_syndromes(cpu) {
            error!("exynos-snapshot: cpu{cpu} {name}: {value:#018x}");
        }
        self.snapshotter.flush_cache_all();

        self.stats.inc_capture();
        info!("exynos-snapshot: context saved(CPU:{cpu})");
        CaptureOutcome::Captured
    }

    /// Write the emergency reason word.
    pub fn report_reason(&self, reason: u32) {
        if let Some(hdr) = self.live_header() {
            hdr.set_emergency_reason(reason);
        }
    }

    pub fn set_core_power_stat(&self, cpu: usize, stat: u32) {
        if let Some(hdr) = self.live_header() {
            hdr.set_core_power_stat(cpu, stat);
        }
    }

    /// Keep the panic message for the post-mortem tool. Empty messages are
    /// ignored; long ones keep their first 1023 bytes.
    pub fn dump_panic(&self, message: &str) {
        if message.is_empty() {
            return;
        }
        if let Some(hdr) = self.live_header() {
            hdr.set_panic_string(message);
        }
    }

    /// Log the task table. Returns the number of tasks listed.
    pub fn dump_task_info(&self) -> usize {
        let tasks = self.platform.tasks();
        info!(
            "exynos-snapshot: {:>8} {:<16} {:>5} {:>3} {:>18} {:>16}",
            "pid", "comm", "state", "cpu", "pc", "exec_start"
        );
        for t in &tasks {
            info!(
                "exynos-snapshot: {:>8} {:<16} {:>5} {:>3} {:#018x} {:>16}",
                t.pid, t.comm, t.state, t.cpu, t.pc, t.exec_start_ns
            );
        }
        tasks.len()
    }

    /// Panic notifier body.
    pub fn panic_handler(&self, cpu: usize, message: &str) {
        self.report_reason(sign::PANIC);
        if !self.is_enabled() {
            return;
        }
        error!("exynos-snapshot: panic on cpu {cpu}: {message}");

        if self.config.boot.panic_reboot {
            for c in 0..self.nr_cpus() {
                if let Some(pcs) = self.platform.last_pcs(c) {
                    self.core_pc(c, pcs);
                }
            }
        }
        self.dump_task_info();
        self.snapshotter.flush_cache_all();
    }

    /// Entry for fault handlers that cannot go through the panic path.
    pub fn panic_handler_safe(&self, cpu: usize) {
        if !self.is_enabled() {
            return;
        }
        self.report_reason(sign::SAFE_FAULT);
        self.dump_panic(&format!("safe panic handler at cpu {cpu}"));
        if self.config.boot.watchdog {
            self.platform.watchdog_emergency_reset(EMERGENCY_RESET_MS);
        }
    }

    /// Reboot notifier body.
    pub fn reboot_handler(&self) {
        info!("exynos-snapshot: normal reboot");
    }

    /// Called before the panic path starts its slow work.
    pub fn prepare_panic(&self) {
        if self.is_enabled() && self.config.boot.watchdog {
            self.platform.watchdog_keepalive();
        }
    }

    /// Last step of a panic on `cpu`: dump, capture, then hand over to the
    /// platform. Real platforms never return from the restart or the stall,
    /// so any return from here is an error.
    pub fn post_panic(&self, cpu: usize) -> Result<()> {
        if let Some(hdr) = self.live_header() {
            self.dump_sfr();
            self.save_context(cpu, None);
            self.snapshotter.flush_cache_all();

            if hdr.scratch() == sign::SCRATCH {
                self.platform.dump_secure_region();
            }

            if self.config.boot.panic_reboot {
                if self.config.boot.watchdog
                    && (self.hardlockup() || self.platform.online_cpus() > 1)
                {
                    self.platform.stall_cpu(cpu);
                }
                self.platform.restart("panic");
            }
        }
        self.platform.stall_cpu(cpu);

        error!("exynos-snapshot: post_panic returned on cpu {cpu}");
        Err(SnapshotError::HaltReturned(cpu))
    }

    /// Mark a graceful restart so the next boot does not read it as a crash.
    pub fn post_reboot(&self, cpu: usize) {
        let Some(hdr) = self.live_header() else {
            return;
        };
        for c in 0..self.nr_cpus() {
            hdr.set_core_panic_stat(c, sign::RESET);
        }
        self.report_reason(sign::NORMAL_REBOOT);
        hdr.set_scratch(sign::RESET);
        self.save_context(cpu, None);
        self.snapshotter.flush_cache_all();
    }
}
