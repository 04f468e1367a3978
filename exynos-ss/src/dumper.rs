//! Read-side replay of a ring, oldest record first.
//!
//! A [`Dumper`] never writes to the rings and takes no locks. A slot that a
//! writer overwrites mid-read comes back as whatever bytes were there.

use std::fmt;

use exynos_ss_common::{
    AcpmLog, Category, ClkLog, ClockeventLog, CoreLog, CpuidleLog, DmLog, FreqLog, HrtimerLog,
    I2cLog, IrqExitLog, IrqLog, IrqsDisabledLog, LogRecord, PmuLog, PrintkLog, PrintklLog,
    RegLog, RegulatorLog, SpiLog, SpinlockLog, SuspendLog, TaskLog, ThermalLog, WorkLog,
    direction, str_from_bytes,
};
use serde::Serialize;

use crate::error::{Result, SnapshotError};
use crate::ring::{KeventsView, RingLayout};
use crate::symbols::SymbolResolver;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// One formatted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpLine {
    pub category: &'static str,
    /// Shard for per-CPU categories.
    pub cpu: Option<usize>,
    pub slot: usize,
    pub time_ns: u64,
    pub text: String,
}

impl fmt::Display for DumpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>7}.{:09}][{:04}:",
            self.time_ns / NSEC_PER_SEC,
            self.time_ns % NSEC_PER_SEC,
            self.slot
        )?;
        match self.cpu {
            Some(cpu) => write!(f, "CPU{cpu}")?,
            None => f.write_str("ALL")?,
        }
        write!(f, "] {:>13}: {}", self.category, self.text)
    }
}

/// Cursor over one shard of one category.
pub struct Dumper<'a> {
    view: &'a KeventsView,
    layout: RingLayout,
    shard: usize,
    resolver: &'a dyn SymbolResolver,
    /// Records written since boot, capped at capacity.
    written: usize,
    init_idx: usize,
    cur_idx: usize,
    visited: usize,
}

impl<'a> Dumper<'a> {
    /// Position a cursor one past the write head of `cpu`'s shard, which is
    /// the oldest surviving record. `cpu` is ignored for global categories.
    pub fn open(
        view: &'a KeventsView,
        category: Category,
        cpu: usize,
        resolver: &'a dyn SymbolResolver,
    ) -> Result<Self> {
        let layout = *view
            .layout(category)
            .ok_or(SnapshotError::CategoryAbsent(category.name()))?;
        let shard = if category.per_cpu() { cpu } else { 0 };
        if shard >= layout.shards {
            return Err(SnapshotError::CpuOutOfRange {
                cpu,
                nr_cpus: layout.shards,
            });
        }
        let head = view.write_index(category, shard).unwrap_or(-1);
        let (written, init_idx) = if head < 0 {
            (0, 0)
        } else {
            let next = head as u64 + 1;
            (
                next.min(layout.capacity as u64) as usize,
                next as usize & layout.mask(),
            )
        };
        Ok(Self {
            view,
            layout,
            shard,
            resolver,
            written,
            init_idx,
            cur_idx: init_idx,
            visited: if written == 0 { layout.capacity } else { 0 },
        })
    }

    pub fn init_idx(&self) -> usize {
        self.init_idx
    }

    pub fn cur_idx(&self) -> usize {
        self.cur_idx
    }

    pub fn category(&self) -> Category {
        self.layout.category
    }

    fn load<T: LogRecord>(&self, slot: usize) -> Option<T> {
        self.view.load::<T>(self.shard, slot)
    }

    fn sym(&self, addr: u64) -> String {
        self.resolver.render(addr)
    }

    fn callers(&self, frames: &[u64]) -> String {
        let rendered: Vec<String> = frames
            .iter()
            .filter(|&&a| a != 0)
            .map(|&a| self.sym(a))
            .collect();
        format!("[{}]", rendered.join(", "))
    }

    fn format(&self, slot: usize) -> Option<(u64, String)> {
        let dir = direction::label;
        let line = match self.layout.category {
            Category::Task => {
                let r: TaskLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "task:{:<16} task_struct:{:#018x} sp:{:#018x}",
                        str_from_bytes(&r.comm),
                        r.task,
                        r.sp
                    ),
                )
            }
            Category::Work => {
                let r: WorkLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: worker:{:#018x} func:{} comm:{}",
                        dir(r.en),
                        r.worker,
                        self.sym(r.func),
                        str_from_bytes(&r.comm)
                    ),
                )
            }
            Category::Cpuidle => {
                let r: CpuidleLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: mode:{} state:{} online:{} stay:{}us",
                        dir(r.en),
                        str_from_bytes(&r.modes),
                        r.state,
                        r.num_online_cpus,
                        r.delta
                    ),
                )
            }
            Category::Suspend => {
                let r: SuspendLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: {} dev:{:#018x} core:{}",
                        dir(r.en),
                        self.sym(r.func),
                        r.dev,
                        r.core
                    ),
                )
            }
            Category::Irq => {
                let r: IrqLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: irq:{} {} preempt:{:#x} val:{:#x}",
                        dir(r.en),
                        r.irq,
                        self.sym(r.func),
                        r.preempt,
                        r.val
                    ),
                )
            }
            Category::IrqExit => {
                let r: IrqExitLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "irq:{} start:{} end:{} latency:{}us",
                        r.irq,
                        r.time,
                        r.end_time,
                        r.latency / 1000
                    ),
                )
            }
            Category::Spinlock => {
                let r: SpinlockLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: magic:{:#x} owner_cpu:{} next:{} owner:{} jiffies:{} task:{:#018x} comm:{} caller:{}",
                        dir(r.en),
                        r.magic,
                        r.owner_cpu,
                        r.next,
                        r.owner,
                        r.jiffies,
                        r.task,
                        str_from_bytes(&r.comm),
                        self.callers(&r.caller)
                    ),
                )
            }
            Category::IrqsDisabled => {
                let r: IrqsDisabledLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: index:{} task:{:#018x} comm:{} caller:{}",
                        dir(r.en),
                        r.index,
                        r.task,
                        str_from_bytes(&r.comm),
                        self.callers(&r.caller)
                    ),
                )
            }
            Category::Reg => {
                let r: RegLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: {} reg:{:#x} val:{:#x} caller:{}",
                        dir(r.en),
                        if r.read != 0 { "read" } else { "write" },
                        r.reg,
                        r.val,
                        self.callers(&r.caller)
                    ),
                )
            }
            Category::Hrtimer => {
                let r: HrtimerLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: timer:{:#018x} now:{} func:{}",
                        dir(r.en),
                        r.timer,
                        r.now,
                        self.sym(r.func)
                    ),
                )
            }
            Category::Clockevent => {
                let r: ClockeventLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "mct_cycle:{} delta:{}ns next_event:{} caller:{}",
                        r.mct_cycle,
                        r.delta_ns,
                        r.next_event,
                        self.callers(&r.caller)
                    ),
                )
            }
            Category::Clk => {
                let r: ClkLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{} clk:{:#018x} func:{} arg:{:#x} mode:{}",
                        str_from_bytes(&r.clk_name),
                        r.clk,
                        self.sym(r.func),
                        r.arg,
                        r.mode
                    ),
                )
            }
            Category::Pmu => {
                let r: PmuLog = self.load(slot)?;
                (
                    r.time,
                    format!("id:{} func:{} mode:{}", r.id, self.sym(r.func), r.mode),
                )
            }
            Category::Freq => {
                let r: FreqLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: {}[{}] cpu:{} {} -> {}",
                        dir(r.en),
                        str_from_bytes(&r.name),
                        r.domain,
                        r.cpu,
                        r.old_freq,
                        r.target_freq
                    ),
                )
            }
            Category::Dm => {
                let r: DmLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "cpu:{} dm:{} min:{} max:{} wait_dmt:{} do_dmt:{}",
                        r.cpu, r.dm_num, r.min_freq, r.max_freq, r.wait_dmt, r.do_dmt
                    ),
                )
            }
            Category::Regulator => {
                let r: RegulatorLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: {} cpu:{} reg:{:#x} voltage:{}",
                        dir(r.en),
                        str_from_bytes(&r.name),
                        r.cpu,
                        r.reg,
                        r.voltage
                    ),
                )
            }
            Category::Thermal => {
                let r: ThermalLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{} cpu:{} temp:{} state:{} data:{:#x}",
                        str_from_bytes(&r.cooling_device),
                        r.cpu,
                        r.temp,
                        r.cooling_state,
                        r.data
                    ),
                )
            }
            Category::Acpm => {
                let r: AcpmLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "acpm_time:{} {} data:{:#x}",
                        r.acpm_time,
                        str_from_bytes(&r.log),
                        r.data
                    ),
                )
            }
            Category::I2c => {
                let r: I2cLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: adap:{:#018x} msgs:{:#018x} num:{} cpu:{}",
                        dir(r.en),
                        r.adap,
                        r.msgs,
                        r.num,
                        r.cpu
                    ),
                )
            }
            Category::Spi => {
                let r: SpiLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "{:>3}: master:{:#018x} msg:{:#018x} cpu:{}",
                        dir(r.en),
                        r.master,
                        r.cur_msg,
                        r.cpu
                    ),
                )
            }
            Category::Printkl => {
                let r: PrintklLog = self.load(slot)?;
                (
                    r.time,
                    format!(
                        "msg:{} val:{:#x} cpu:{} caller:{}",
                        self.sym(r.msg),
                        r.val,
                        r.cpu,
                        self.callers(&r.caller)
                    ),
                )
            }
            Category::Printk => {
                let r: PrintkLog = self.load(slot)?;
                (r.time, format!("cpu:{} {}", r.cpu, str_from_bytes(&r.log)))
            }
            Category::Core => {
                let r: CoreLog = self.load(slot)?;
                (r.time, format!("last_pc:{}", self.callers(&r.last_pc)))
            }
        };
        Some(line)
    }
}

impl Iterator for Dumper<'_> {
    type Item = DumpLine;

    fn next(&mut self) -> Option<DumpLine> {
        while self.visited < self.layout.capacity {
            let slot = self.cur_idx;
            self.cur_idx = (self.cur_idx + 1) & self.layout.mask();
            self.visited += 1;
            if self.written < self.layout.capacity && slot >= self.written {
                continue;
            }
            let Some((time_ns, text)) = self.format(slot) else {
                continue;
            };
            return Some(DumpLine {
                category: self.layout.category.name(),
                cpu: self.layout.category.per_cpu().then_some(self.shard),
                slot,
                time_ns,
                text,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{AnonymousReserver, MemoryReserver};
    use crate::ring::RingPlan;
    use crate::symbols::{NoSymbols, SymbolTable};
    use bytemuck::Zeroable;

    fn view(region: &crate::region::ReservedRegion) -> KeventsView {
        KeventsView::format(
            region.raw(),
            &[
                RingPlan {
                    category: Category::Irq,
                    shards: 2,
                    capacity: 4,
                },
                RingPlan {
                    category: Category::Printk,
                    shards: 1,
                    capacity: 4,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn empty_ring_is_exhausted() {
        let region = AnonymousReserver::new().reserve(0, 128 * 1024).unwrap();
        let view = view(&region);
        let mut d = Dumper::open(&view, Category::Irq, 0, &NoSymbols).unwrap();
        assert!(d.next().is_none());
    }

    #[test]
    fn partial_ring_skips_unwritten_slots() {
        let region = AnonymousReserver::new().reserve(0, 128 * 1024).unwrap();
        let view = view(&region);
        let ring = view.ring::<IrqLog>().unwrap();
        for irq in [10, 11] {
            let mut r = IrqLog::zeroed();
            r.irq = irq;
            r.en = direction::IN;
            ring.push(1, r);
        }
        let d = Dumper::open(&view, Category::Irq, 1, &NoSymbols).unwrap();
        assert_eq!(d.init_idx(), 2);
        let lines: Vec<_> = d.collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].text.contains("irq:10"));
        assert!(lines[1].text.contains("irq:11"));
        assert_eq!(lines[0].cpu, Some(1));
    }

    #[test]
    fn line_renders_symbol_or_hex() {
        let region = AnonymousReserver::new().reserve(0, 128 * 1024).unwrap();
        let view = view(&region);
        let mut r = IrqLog::zeroed();
        r.time = 12_345_678_901;
        r.irq = 42;
        r.func = 0xffffff8008081010;
        r.en = direction::IN;
        view.ring::<IrqLog>().unwrap().push(0, r);

        let symbols =
            SymbolTable::from_system_map("ffffff8008081000 T gic_handle_irq\n");
        let line = Dumper::open(&view, Category::Irq, 0, &symbols)
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(
            line.to_string(),
            "[     12.345678901][0000:CPU0]           irq:  IN: irq:42 gic_handle_irq+0x10 preempt:0x0 val:0x0"
        );

        let plain = Dumper::open(&view, Category::Irq, 0, &NoSymbols)
            .unwrap()
            .next()
            .unwrap();
        assert!(plain.text.contains("0xffffff8008081010"));
    }

    #[test]
    fn global_category_ignores_cpu() {
        let region = AnonymousReserver::new().reserve(0, 128 * 1024).unwrap();
        let view = view(&region);
        let mut r = PrintkLog::zeroed();
        exynos_ss_common::copy_str(&mut r.log, "hello");
        view.ring::<PrintkLog>().unwrap().push(0, r);
        let line = Dumper::open(&view, Category::Printk, 5, &NoSymbols)
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(line.cpu, None);
        assert!(line.to_string().contains("[0000:ALL]"));
        assert!(line.text.ends_with("hello"));
    }

    #[test]
    fn open_rejects_absent_category_and_bad_cpu() {
        let region = AnonymousReserver::new().reserve(0, 128 * 1024).unwrap();
        let view = view(&region);
        assert!(matches!(
            Dumper::open(&view, Category::Task, 0, &NoSymbols),
            Err(SnapshotError::CategoryAbsent("task"))
        ));
        assert!(matches!(
            Dumper::open(&view, Category::Irq, 2, &NoSymbols),
            Err(SnapshotError::CpuOutOfRange { cpu: 2, nr_cpus: 2 })
        ));
    }
}
