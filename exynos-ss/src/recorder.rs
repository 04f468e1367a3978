//! Event recorders, one per category.
//!
//! Every recorder is a no-op unless base, the `log_kevents` item and the
//! category are all enabled. None of them allocate, lock or log; they are
//! meant for interrupt, lock and scheduler paths. `en` arguments take the
//! [`direction`](exynos_ss_common::direction) constants.

use std::fmt::{self, Write};

use exynos_ss_common::{
    AcpmLog, Category, ClkLog, ClockeventLog, CoreLog, CpuidleLog, DmLog, FreqLog, HrtimerLog,
    I2cLog, IrqExitLog, IrqLog, IrqsDisabledLog, LOG_STRING_LEN, LogRecord, PmuLog, PrintkLog,
    PrintklLog, RegLog, RegulatorLog, SpiLog, SpinlockLog, SuspendLog, TaskLog, ThermalLog,
    WorkLog, copy_str, direction,
};

use crate::context::DiagnosticsContext;

/// Lock word fields captured by the spinlock recorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockState {
    pub magic: u32,
    pub owner_cpu: u32,
    pub next: u16,
    pub owner: u16,
}

#[inline(always)]
fn stack_marker() -> u64 {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as u64
}

/// Truncating `fmt::Write` over a fixed buffer, always NUL-terminated.
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len().saturating_sub(1).saturating_sub(self.len);
        let mut n = s.len().min(room);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

impl DiagnosticsContext {
    #[inline(always)]
    fn shard(category: Category, cpu: usize) -> usize {
        if category.per_cpu() { cpu } else { 0 }
    }

    /// Claim a slot on the ring of `T` and store what `build` makes of the
    /// timestamp.
    #[inline(always)]
    fn emit<T: LogRecord>(&self, cpu: usize, build: impl FnOnce(u64) -> T) {
        let Some(kevents) = self.kevents_for(T::CATEGORY) else {
            return;
        };
        let Some(ring) = kevents.ring::<T>() else {
            return;
        };
        let shard = Self::shard(T::CATEGORY, cpu);
        let Some(index) = ring.claim(shard) else {
            return;
        };
        ring.store(shard, index, build(self.clock.cpu_clock(cpu)));
        self.stats.inc_record(T::CATEGORY);
    }

    pub fn task(&self, cpu: usize, task: u64, comm: &str) {
        self.emit(cpu, |time| {
            let mut rec = TaskLog {
                time,
                sp: stack_marker(),
                task,
                comm: [0; 16],
            };
            copy_str(&mut rec.comm, comm);
            rec
        });
    }

    pub fn work(&self, cpu: usize, worker: u64, func: u64, comm: &str, en: u32) {
        self.emit(cpu, |time| {
            let mut rec = WorkLog {
                time,
                sp: stack_marker(),
                worker,
                func,
                comm: [0; 16],
                en,
                _pad: 0,
            };
            copy_str(&mut rec.comm, comm);
            rec
        });
    }

    /// `delta_us` is the time spent in the previous state.
    pub fn cpuidle(&self, cpu: usize, modes: &str, state: u32, delta_us: u32, en: u32) {
        let online = self.platform.online_cpus() as u32;
        self.emit(cpu, |time| {
            let mut rec = CpuidleLog {
                time,
                sp: stack_marker(),
                modes: [0; 16],
                state,
                num_online_cpus: online,
                delta: delta_us,
                en,
            };
            copy_str(&mut rec.modes, modes);
            rec
        });
    }

    pub fn suspend(&self, cpu: usize, func: u64, dev: u64, en: u32) {
        self.emit(cpu, |time| SuspendLog {
            time,
            sp: stack_marker(),
            func,
            dev,
            en,
            core: cpu as u32,
        });
    }

    /// Excluded irqs never claim an index.
    pub fn irq(&self, cpu: usize, irq: u32, func: u64, preempt: u32, val: u32, en: u32) {
        if self.filters.irq.contains(irq) {
            self.stats.inc_filtered();
            return;
        }
        self.emit(cpu, |time| IrqLog {
            time,
            sp: stack_marker(),
            func,
            irq,
            preempt,
            val,
            en,
        });
    }

    /// Record a handler that ran from `start_ns` until now, if it took longer
    /// than the configured threshold. Rejected records give their index back.
    pub fn irq_exit(&self, cpu: usize, irq: u32, start_ns: u64) {
        let Some(kevents) = self.kevents_for(Category::IrqExit) else {
            return;
        };
        if self.filters.irq_exit.contains(irq) {
            self.stats.inc_filtered();
            return;
        }
        let Some(ring) = kevents.ring::<IrqExitLog>() else {
            return;
        };
        let Some(index) = ring.claim(cpu) else {
            return;
        };
        let end = self.clock.cpu_clock(cpu);
        let latency = end.saturating_sub(start_ns);
        if !self.filters.above_threshold(latency) {
            ring.rollback(cpu);
            self.stats.inc_below_threshold();
            return;
        }
        ring.store(
            cpu,
            index,
            IrqExitLog {
                time: start_ns,
                end_time: end,
                latency,
                irq,
                _pad: 0,
            },
        );
        self.stats.inc_record(Category::IrqExit);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn spinlock(
        &self,
        cpu: usize,
        lock: LockState,
        task: u64,
        comm: &str,
        jiffies: u64,
        callstack: &[u64],
        en: u32,
    ) {
        let caller = self.fill_callstack(callstack);
        self.emit(cpu, |time| {
            let mut rec = SpinlockLog {
                time,
                sp: stack_marker(),
                jiffies,
                task,
                magic: lock.magic,
                owner_cpu: lock.owner_cpu,
                next: lock.next,
                owner: lock.owner,
                en,
                caller,
                comm: [0; 16],
            };
            copy_str(&mut rec.comm, comm);
            rec
        });
    }

    /// Local interrupts were just disabled (`true`) or re-enabled.
    pub fn irqs_disabled(
        &self,
        cpu: usize,
        disabled: bool,
        task: u64,
        comm: &str,
        callstack: &[u64],
    ) {
        let Some(kevents) = self.kevents_for(Category::IrqsDisabled) else {
            return;
        };
        let Some(ring) = kevents.ring::<IrqsDisabledLog>() else {
            return;
        };
        let Some(index) = ring.claim(cpu) else {
            return;
        };
        let mut rec = IrqsDisabledLog {
            time: self.clock.cpu_clock(cpu),
            index: index as u64,
            task,
            comm: [0; 16],
            caller: self.fill_callstack(callstack),
            en: if disabled { direction::IN } else { direction::OUT },
            _pad: 0,
        };
        copy_str(&mut rec.comm, comm);
        ring.store(cpu, index, rec);
        self.stats.inc_record(Category::IrqsDisabled);
    }

    /// Register access at virtual address `vaddr`. Accesses inside an
    /// excluded physical range give their index back.
    pub fn reg(&self, cpu: usize, read: bool, vaddr: u64, val: u64, en: u32, callstack: &[u64]) {
        let Some(kevents) = self.kevents_for(Category::Reg) else {
            return;
        };
        let Some(ring) = kevents.ring::<RegLog>() else {
            return;
        };
        let Some(index) = ring.claim(cpu) else {
            return;
        };
        let paddr = self.platform.virt_to_phys(vaddr);
        if self.filters.reg.contains(paddr) {
            ring.rollback(cpu);
            self.stats.inc_filtered();
            return;
        }
        ring.store(
            cpu,
            index,
            RegLog {
                time: self.clock.cpu_clock(cpu),
                val,
                reg: paddr,
                read: read as u32,
                en,
                caller: self.fill_callstack(callstack),
            },
        );
        self.stats.inc_record(Category::Reg);
    }

    pub fn hrtimer(&self, cpu: usize, timer: u64, now: u64, func: u64, en: u32) {
        self.emit(cpu, |time| HrtimerLog {
            time,
            now,
            timer,
            func,
            en,
            _pad: 0,
        });
    }

    pub fn clockevent(
        &self,
        cpu: usize,
        mct_cycle: u64,
        delta_ns: i64,
        next_event: i64,
        callstack: &[u64],
    ) {
        let caller = self.fill_callstack(callstack);
        self.emit(cpu, |time| ClockeventLog {
            time,
            mct_cycle,
            delta_ns,
            next_event,
            caller,
        });
    }

    pub fn clk(&self, cpu: usize, clk: u64, name: &str, func: u64, arg: u64, mode: u32) {
        self.emit(cpu, |time| {
            let mut rec = ClkLog {
                time,
                clk,
                arg,
                clk_name: [0; 24],
                func,
                mode,
                _pad: 0,
            };
            copy_str(&mut rec.clk_name, name);
            rec
        });
    }

    pub fn pmu(&self, cpu: usize, id: u32, func: u64, mode: u32) {
        self.emit(cpu, |time| PmuLog {
            time,
            func,
            id,
            mode,
        });
    }

    /// Domain names come from the configured frequency domain table.
    pub fn freq(&self, cpu: usize, domain: u32, old_freq: u64, target_freq: u64, en: u32) {
        let name = self
            .config
            .categories
            .freq_domains
            .get(domain as usize)
            .map(String::as_str)
            .unwrap_or("");
        self.emit(cpu, |time| {
            let mut rec = FreqLog {
                time,
                old_freq,
                target_freq,
                name: [0; 8],
                domain,
                cpu: cpu as u32,
                en,
                _pad: 0,
            };
            copy_str(&mut rec.name, name);
            rec
        });
    }

    pub fn dm(
        &self,
        cpu: usize,
        dm_num: u32,
        min_freq: u64,
        max_freq: u64,
        wait_dmt: i32,
        do_dmt: i32,
    ) {
        self.emit(cpu, |time| DmLog {
            time,
            min_freq,
            max_freq,
            cpu: cpu as u32,
            dm_num,
            wait_dmt,
            do_dmt,
        });
    }

    pub fn regulator(&self, cpu: usize, name: &str, reg: u32, voltage: u32, en: u32) {
        self.emit(cpu, |time| {
            let mut rec = RegulatorLog {
                time,
                name: [0; 16],
                cpu: cpu as u32,
                reg,
                voltage,
                en,
            };
            copy_str(&mut rec.name, name);
            rec
        });
    }

    pub fn thermal(
        &self,
        cpu: usize,
        data: u64,
        temp: u32,
        cooling_device: &str,
        cooling_state: u32,
    ) {
        self.emit(cpu, |time| {
            let mut rec = ThermalLog {
                time,
                data,
                cooling_device: [0; 16],
                cpu: cpu as u32,
                temp,
                cooling_state,
                _pad: 0,
            };
            copy_str(&mut rec.cooling_device, cooling_device);
            rec
        });
    }

    /// Firmware log entry. The tag keeps its first nine bytes.
    pub fn acpm(&self, cpu: usize, acpm_time: u64, tag: &str, data: u32) {
        self.emit(cpu, |time| {
            let mut rec = AcpmLog {
                time,
                acpm_time,
                log: [0; 16],
                data,
                _pad: 0,
            };
            copy_str(&mut rec.log[..10], tag);
            rec
        });
    }

    pub fn i2c(&self, cpu: usize, adap: u64, msgs: u64, num: i32, en: u32) {
        self.emit(cpu, |time| I2cLog {
            time,
            adap,
            msgs,
            cpu: cpu as u32,
            num,
            en,
            _pad: 0,
        });
    }

    pub fn spi(&self, cpu: usize, master: u64, cur_msg: u64, en: u32) {
        self.emit(cpu, |time| SpiLog {
            time,
            master,
            cur_msg,
            cpu: cpu as u32,
            en,
        });
    }

    /// Pointer-sized message with one value, for paths where formatting is
    /// too expensive.
    pub fn printkl(&self, cpu: usize, msg: u64, val: u64, callstack: &[u64]) {
        let caller = self.fill_callstack(callstack);
        self.emit(cpu, |time| PrintklLog {
            time,
            msg,
            val,
            cpu: cpu as u32,
            _pad: 0,
            caller,
        });
    }

    /// Formatted text, truncated to the record's text field.
    ///
    /// ```ignore
    /// ctx.printk(0, format_args!("dvfs {} -> {}", old, new), &[]);
    /// ```
    pub fn printk(&self, cpu: usize, args: fmt::Arguments<'_>, callstack: &[u64]) {
        let caller = self.fill_callstack(callstack);
        self.emit(cpu, |time| {
            let mut rec = PrintkLog {
                time,
                log: [0; LOG_STRING_LEN],
                cpu: cpu as u32,
                _pad: 0,
                caller,
            };
            let mut w = FixedWriter {
                buf: &mut rec.log,
                len: 0,
            };
            let _ = w.write_fmt(args);
            rec
        });
    }

    /// Last program counters of `cpu`, sampled at panic.
    pub fn core_pc(&self, cpu: usize, last_pc: [u64; 5]) {
        self.emit(cpu, |time| CoreLog { time, last_pc });
    }
}
