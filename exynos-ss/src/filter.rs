//! Record filters checked on the hot path: irq exclusion lists, the irq-exit
//! latency threshold and the register range exclusion list.
//!
//! Lists are fixed-capacity and append-only. Appends race-free via
//! compare-exchange on an empty slot; lookups are plain relaxed loads.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::config::{FiltersConfig, IRQ_EXLIST_MAX, REG_EXLIST_MAX, RegRange};

const EMPTY_IRQ: i64 = -1;

/// The list had no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListFull;

#[derive(Debug)]
pub struct IrqExclusionList {
    slots: [AtomicI64; IRQ_EXLIST_MAX],
}

impl Default for IrqExclusionList {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicI64::new(EMPTY_IRQ)),
        }
    }
}

impl IrqExclusionList {
    pub fn new(initial: &[u32]) -> Self {
        let list = Self::default();
        for &irq in initial.iter().take(IRQ_EXLIST_MAX) {
            let _ = list.push(irq);
        }
        list
    }

    #[inline]
    pub fn contains(&self, irq: u32) -> bool {
        for slot in &self.slots {
            let v = slot.load(Ordering::Relaxed);
            if v == EMPTY_IRQ {
                return false;
            }
            if v == irq as i64 {
                return true;
            }
        }
        false
    }

    pub fn push(&self, irq: u32) -> Result<(), ListFull> {
        for slot in &self.slots {
            if slot
                .compare_exchange(EMPTY_IRQ, irq as i64, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(ListFull)
    }

    pub fn entries(&self) -> Vec<u32> {
        self.slots
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .take_while(|&v| v != EMPTY_IRQ)
            .map(|v| v as u32)
            .collect()
    }
}

#[derive(Debug)]
struct RegSlot {
    addr: AtomicU64,
    size: AtomicU64,
}

/// Physical register ranges whose accesses are not recorded. A zero address
/// marks the end of the list.
#[derive(Debug)]
pub struct RegExclusionList {
    slots: [RegSlot; REG_EXLIST_MAX],
}

impl Default for RegExclusionList {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| RegSlot {
                addr: AtomicU64::new(0),
                size: AtomicU64::new(0),
            }),
        }
    }
}

impl RegExclusionList {
    pub fn new(initial: &[RegRange]) -> Self {
        let list = Self::default();
        for range in initial.iter().take(REG_EXLIST_MAX) {
            let _ = list.push(range.addr, range.size);
        }
        list
    }

    #[inline]
    pub fn contains(&self, paddr: u64) -> bool {
        for slot in &self.slots {
            let addr = slot.addr.load(Ordering::Relaxed);
            if addr == 0 {
                return false;
            }
            let size = slot.size.load(Ordering::Relaxed);
            if paddr >= addr && paddr - addr < size {
                return true;
            }
        }
        false
    }

    pub fn push(&self, addr: u64, size: u64) -> Result<(), ListFull> {
        if addr == 0 {
            return Ok(());
        }
        for slot in &self.slots {
            if slot
                .addr
                .compare_exchange(0, addr, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                slot.size.store(size, Ordering::Relaxed);
                return Ok(());
            }
        }
        Err(ListFull)
    }

    pub fn entries(&self) -> Vec<RegRange> {
        self.slots
            .iter()
            .map(|s| RegRange {
                addr: s.addr.load(Ordering::Relaxed),
                size: s.size.load(Ordering::Relaxed),
            })
            .take_while(|r| r.addr != 0)
            .collect()
    }
}

/// Every filter the recorders consult.
#[derive(Debug)]
pub struct Filters {
    pub irq: IrqExclusionList,
    pub irq_exit: IrqExclusionList,
    pub reg: RegExclusionList,
    irq_exit_threshold_us: AtomicU32,
}

impl Filters {
    pub fn new(cfg: &FiltersConfig) -> Self {
        Self {
            irq: IrqExclusionList::new(&cfg.irq_exclude),
            irq_exit: IrqExclusionList::new(&cfg.irq_exit_exclude),
            reg: RegExclusionList::new(&cfg.reg_exclude),
            irq_exit_threshold_us: AtomicU32::new(cfg.irq_exit_threshold_us),
        }
    }

    pub fn irq_exit_threshold_us(&self) -> u32 {
        self.irq_exit_threshold_us.load(Ordering::Relaxed)
    }

    pub fn set_irq_exit_threshold_us(&self, us: u32) {
        self.irq_exit_threshold_us.store(us, Ordering::Relaxed);
    }

    /// True when an irq-exit latency is worth keeping.
    #[inline]
    pub fn above_threshold(&self, latency_ns: u64) -> bool {
        latency_ns > u64::from(self.irq_exit_threshold_us()) * 1000
    }
}
