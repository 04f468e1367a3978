//! Memory layout: item placement and the fixed header block.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use exynos_ss_common::{
    CoreRegisters, HEADER_MAGIC, HeaderBase, ITEM_MAX, ItemDescriptor, MAX_CPUS, MmuRegisters,
    copy_str, header, item_flags, str_from_bytes,
};

use crate::config::{ItemConfig, KEVENTS_ITEM};
use crate::region::RawRegion;

/// Where an item landed, before any memory exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub name: String,
    /// Bytes from the region base.
    pub offset: usize,
    pub size: usize,
    pub persist: bool,
    pub enabled: bool,
}

/// Contiguous placement of the item table starting at the region base.
///
/// `log_kevents` is always placed; when it is configured off it still gets a
/// header-only allocation. Other disabled items take no space.
pub fn place_items(items: &[ItemConfig]) -> (Vec<Placement>, usize) {
    let mut offset = 0usize;
    let mut placed = Vec::with_capacity(items.len());
    for item in items {
        let is_kevents = item.name == KEVENTS_ITEM;
        if !item.enabled && !is_kevents {
            continue;
        }
        let size = if is_kevents && !item.enabled {
            header::ALLOC_SIZE
        } else {
            item.size
        };
        placed.push(Placement {
            name: item.name.clone(),
            offset,
            size,
            persist: item.persist,
            enabled: item.enabled,
        });
        offset += size;
    }
    (placed, offset)
}

/// Runtime state of a placed item.
#[derive(Debug)]
pub struct Item {
    pub name: String,
    pub size: usize,
    pub persist: bool,
    /// Enabled at boot; an item that was off at boot never comes on.
    pub enabled_init: bool,
    enabled: AtomicBool,
    pub paddr: u64,
    pub vaddr: u64,
    pub(crate) offset: usize,
    /// Write cursor within the item, for byte-ring items.
    pub(crate) cursor: AtomicUsize,
    disabled_at_ns: AtomicU64,
}

impl Item {
    pub(crate) fn new(placement: &Placement, base_paddr: u64, base_vaddr: u64) -> Self {
        Self {
            name: placement.name.clone(),
            size: placement.size,
            persist: placement.persist,
            enabled_init: placement.enabled,
            enabled: AtomicBool::new(placement.enabled),
            paddr: base_paddr + placement.offset as u64,
            vaddr: base_vaddr + placement.offset as u64,
            offset: placement.offset,
            cursor: AtomicUsize::new(0),
            disabled_at_ns: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.enabled_init && self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, on: bool, now_ns: u64) {
        self.enabled.store(on, Ordering::Relaxed);
        if !on {
            self.disabled_at_ns.store(now_ns, Ordering::Relaxed);
        }
    }

    pub(crate) fn disabled_at_ns(&self) -> u64 {
        self.disabled_at_ns.load(Ordering::Relaxed)
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    fn descriptor(&self) -> ItemDescriptor {
        let mut name = [0u8; 16];
        copy_str(&mut name, &self.name);
        let mut flags = 0;
        if self.enabled_init {
            flags |= item_flags::ENABLED;
        }
        if self.persist {
            flags |= item_flags::PERSIST;
        }
        ItemDescriptor {
            name,
            paddr: self.paddr,
            size: self.size as u64,
            flags,
            _pad: 0,
        }
    }
}

/// Item entry read back from a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub name: String,
    pub paddr: u64,
    pub size: u64,
    pub enabled: bool,
    pub persist: bool,
}

/// The fixed header block at the start of `log_kevents`.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    raw: RawRegion,
}

impl Header {
    pub fn new(raw: RawRegion) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> RawRegion {
        self.raw
    }

    pub fn base(&self) -> HeaderBase {
        self.raw.read(header::BASE)
    }

    pub fn set_base(&self, base: HeaderBase) {
        self.raw.write(header::BASE, base);
    }

    pub fn magic_ok(&self) -> bool {
        self.base().magic == HEADER_MAGIC
    }

    pub fn scratch(&self) -> u32 {
        self.raw.read_u32(header::SCRATCH)
    }

    pub fn set_scratch(&self, value: u32) {
        self.raw.write_u32(header::SCRATCH, value);
    }

    pub fn last_logbuf(&self) -> u64 {
        self.raw.read_u64(header::LAST_LOGBUF)
    }

    pub fn set_last_logbuf(&self, value: u64) {
        self.raw.write_u64(header::LAST_LOGBUF, value);
    }

    pub fn emergency_reason(&self) -> u32 {
        self.raw.read_u32(header::EMERGENCY_REASON)
    }

    pub fn set_emergency_reason(&self, value: u32) {
        self.raw.write_u32(header::EMERGENCY_REASON, value);
    }

    pub fn core_power_stat(&self, cpu: usize) -> u32 {
        self.raw.read_u32(header::CORE_POWER_STAT + cpu * 4)
    }

    pub fn set_core_power_stat(&self, cpu: usize, value: u32) {
        if cpu < MAX_CPUS {
            self.raw.write_u32(header::CORE_POWER_STAT + cpu * 4, value);
        }
    }

    pub fn core_panic_stat(&self, cpu: usize) -> u32 {
        self.raw.read_u32(header::CORE_PANIC_STAT + cpu * 4)
    }

    pub fn set_core_panic_stat(&self, cpu: usize, value: u32) {
        if cpu < MAX_CPUS {
            self.raw.write_u32(header::CORE_PANIC_STAT + cpu * 4, value);
        }
    }

    pub fn mmu_registers(&self, cpu: usize) -> MmuRegisters {
        self.raw.read(header::MMU_REG + cpu * header::REG_STRIDE)
    }

    pub fn set_mmu_registers(&self, cpu: usize, regs: MmuRegisters) {
        if cpu < MAX_CPUS {
            self.raw.write(header::MMU_REG + cpu * header::REG_STRIDE, regs);
        }
    }

    pub fn core_registers(&self, cpu: usize) -> CoreRegisters {
        self.raw.read(header::CORE_REG + cpu * header::REG_STRIDE)
    }

    pub fn set_core_registers(&self, cpu: usize, regs: CoreRegisters) {
        if cpu < MAX_CPUS {
            self.raw.write(header::CORE_REG + cpu * header::REG_STRIDE, regs);
        }
    }

    /// Stored panic string, up to the first NUL.
    pub fn panic_string(&self) -> String {
        let mut buf = [0u8; header::PANIC_STRING_LEN];
        self.raw.copy_to(header::PANIC_STRING, &mut buf);
        str_from_bytes(&buf).to_string()
    }

    /// Store `text`, truncated on a char boundary to leave room for the NUL.
    pub fn set_panic_string(&self, text: &str) {
        let mut end = text.len().min(header::PANIC_STRING_LEN - 1);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0u8; header::PANIC_STRING_LEN];
        buf[..end].copy_from_slice(&text.as_bytes()[..end]);
        self.raw.copy_from(header::PANIC_STRING, &buf);
    }

    pub(crate) fn write_item_table(&self, items: &[Item]) {
        let stride = size_of::<ItemDescriptor>();
        for (i, item) in items.iter().take(ITEM_MAX).enumerate() {
            self.raw
                .write(header::ITEM_TABLE + i * stride, item.descriptor());
        }
    }

    pub fn item_table(&self) -> Vec<ItemInfo> {
        let stride = size_of::<ItemDescriptor>();
        (0..ITEM_MAX)
            .map(|i| self.raw.read::<ItemDescriptor>(header::ITEM_TABLE + i * stride))
            .take_while(|d| d.name[0] != 0)
            .map(|d| ItemInfo {
                name: str_from_bytes(&d.name).to_string(),
                paddr: d.paddr,
                size: d.size,
                enabled: d.flags & item_flags::ENABLED != 0,
                persist: d.flags & item_flags::PERSIST != 0,
            })
            .collect()
    }

    /// Clear everything past the kept prefix, up to `len` bytes.
    pub(crate) fn clear_after_keep(&self, len: usize) {
        let len = len.min(self.raw.len());
        if len > header::KEEP_SIZE {
            self.raw.fill(header::KEEP_SIZE, len - header::KEEP_SIZE, 0);
        }
    }
}
