//! The process-wide snapshot context: boot, item table, enable switches and
//! the exported queries other drivers use.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use exynos_ss_common::{CALLSTACK_MAX, Category, HEADER_MAGIC, HeaderBase, header, sign};
use log::{error, info, warn};

use crate::clock::{BootClock, Clock};
use crate::config::{Config, KERNEL_ITEM, KEVENTS_ITEM};
use crate::crash_key::CrashKey;
use crate::error::{Result, SnapshotError};
use crate::filter::Filters;
use crate::hooks::PmsgLogger;
use crate::layout::{Header, Item, ItemInfo, place_items};
use crate::platform::{CpuStateSnapshotter, NoopSnapshotter, NullPlatform, PlatformHooks};
use crate::region::{MemoryReserver, RawRegion, ReservedRegion};
use crate::ring::{KeventsView, RingPlan};
use crate::stats::RecorderStats;

/// Parse the `ess_setup=` boot parameter: decimal, `0x` hex or `0` octal.
pub fn parse_base_address(param: Option<&str>) -> Result<u64> {
    let raw = param.map(str::trim).filter(|s| !s.is_empty());
    let Some(raw) = raw else {
        return Err(SnapshotError::NoBaseAddress);
    };
    parse_ulong(raw).ok_or_else(|| SnapshotError::InvalidBaseAddress(raw.to_string()))
}

/// Unsigned integer with C-style base detection.
pub fn parse_ulong(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if s.len() > 1 && s.starts_with('0') {
        return u64::from_str_radix(&s[1..], 8).ok();
    }
    s.parse().ok()
}

/// Builds a [`DiagnosticsContext`] with its collaborators.
pub struct ContextBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    snapshotter: Arc<dyn CpuStateSnapshotter>,
    platform: Arc<dyn PlatformHooks>,
}

impl ContextBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(BootClock),
            snapshotter: Arc::new(NoopSnapshotter),
            platform: Arc::new(NullPlatform),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn snapshotter(mut self, snapshotter: Arc<dyn CpuStateSnapshotter>) -> Self {
        self.snapshotter = snapshotter;
        self
    }

    pub fn platform(mut self, platform: Arc<dyn PlatformHooks>) -> Self {
        self.platform = platform;
        self
    }

    /// Reserve and lay out the region. Never fails: any error is logged once
    /// and yields a context whose recorders are all no-ops.
    pub fn boot(self, reserver: &mut dyn MemoryReserver, base: Option<&str>) -> DiagnosticsContext {
        match self.try_boot(reserver, base) {
            Ok(ctx) => ctx,
            Err((builder, e)) => {
                error!("exynos-snapshot: {e}, snapshot disabled");
                builder.disabled()
            }
        }
    }

    /// Like [`ContextBuilder::boot`] but hands the error back.
    #[allow(clippy::result_large_err)]
    pub fn try_boot(
        self,
        reserver: &mut dyn MemoryReserver,
        base: Option<&str>,
    ) -> std::result::Result<DiagnosticsContext, (Self, SnapshotError)> {
        match self.setup(reserver, base) {
            Ok(booted) => Ok(self.finish(Some(booted))),
            Err(e) => Err((self, e)),
        }
    }

    /// A context that records nothing.
    pub fn disabled(self) -> DiagnosticsContext {
        self.finish(None)
    }

    fn setup(&self, reserver: &mut dyn MemoryReserver, base: Option<&str>) -> Result<Booted> {
        self.config.validate()?;
        let paddr = parse_base_address(base)?;

        let (placements, total) = place_items(&self.config.item_table());
        let region = reserver.reserve(paddr, total)?;
        if region.len() < total {
            return Err(SnapshotError::Reservation {
                paddr,
                size: total,
                reason: format!("granted only {:#x} bytes", region.len()),
            });
        }
        let vaddr = region.vaddr();
        let items: Vec<Item> = placements
            .iter()
            .map(|p| Item::new(p, paddr, vaddr))
            .collect();

        let kevents_item = &items[0];
        let raw = region.raw();
        let kevents_raw = raw
            .sub(kevents_item.offset, kevents_item.size)
            .ok_or_else(|| SnapshotError::Config(format!("{KEVENTS_ITEM} out of range")))?;
        let hdr = Header::new(kevents_raw);

        hdr.clear_after_keep(kevents_item.size);
        hdr.set_base(HeaderBase {
            vaddr,
            paddr,
            size: total as u64,
            magic: HEADER_MAGIC,
        });
        hdr.write_item_table(&items);
        for cpu in 0..self.config.boot.nr_cpus {
            hdr.set_core_power_stat(cpu, sign::ALIVE);
        }

        let kevents = if kevents_item.enabled_init {
            Some(KeventsView::format(kevents_raw, &self.ring_plan())?)
        } else {
            None
        };

        for item in items.iter().skip(1) {
            let Some(item_raw) = raw.sub(item.offset, item.size) else {
                continue;
            };
            if item.name == KERNEL_ITEM {
                recover_kernel_cursor(&hdr, item, item_raw);
            } else if !item.persist {
                item_raw.fill(0, item.size, 0);
            }
        }

        hdr.set_scratch(sign::SCRATCH);
        info!(
            "exynos-snapshot: base paddr {paddr:#x} vaddr {vaddr:#x} size {total:#x} ({} items)",
            items.len()
        );
        for item in &items {
            info!(
                "exynos-snapshot: {:<16} paddr {:#x} vaddr {:#x} size {:#x}{}",
                item.name,
                item.paddr,
                item.vaddr,
                item.size,
                if item.persist { " persist" } else { "" }
            );
        }

        Ok(Booted {
            region,
            items,
            header: hdr,
            kevents,
        })
    }

    fn ring_plan(&self) -> Vec<RingPlan> {
        Category::ALL
            .iter()
            .copied()
            .filter(|&c| self.config.category_enabled(c))
            .map(|category| RingPlan {
                category,
                shards: if category.per_cpu() {
                    self.config.boot.nr_cpus
                } else {
                    1
                },
                capacity: self.config.capacity(category),
            })
            .collect()
    }

    fn finish(self, booted: Option<Booted>) -> DiagnosticsContext {
        let (region, items, header, kevents) = match booted {
            Some(b) => (Some(b.region), b.items, Some(b.header), b.kevents),
            None => (None, Vec::new(), None, None),
        };
        let categories = std::array::from_fn(|i| {
            let laid_out = kevents
                .as_ref()
                .is_some_and(|k| k.layout(Category::ALL[i]).is_some());
            AtomicBool::new(laid_out)
        });
        DiagnosticsContext {
            enabled: AtomicBool::new(region.is_some()),
            callstack: AtomicUsize::new(self.config.categories.callstack.clamp(1, CALLSTACK_MAX)),
            hardlockup: AtomicBool::new(false),
            filters: Filters::new(&self.config.filters),
            stats: RecorderStats::new(),
            pmsg: Mutex::new(PmsgLogger::default()),
            crash_key: Mutex::new(CrashKey::default()),
            region,
            items,
            header,
            kevents,
            categories,
            config: self.config,
            clock: self.clock,
            snapshotter: self.snapshotter,
            platform: self.platform,
        }
    }
}

struct Booted {
    region: ReservedRegion,
    items: Vec<Item>,
    header: Header,
    kevents: Option<KeventsView>,
}

/// Resume the console mirror where the previous boot left off, or start clean
/// when the saved pointer does not belong to this item.
fn recover_kernel_cursor(hdr: &Header, item: &Item, item_raw: RawRegion) {
    let last = hdr.last_logbuf();
    let end = item.paddr + item.size as u64;
    if last >= item.paddr && last < end {
        let cursor = (last - item.paddr) as usize;
        item.cursor.store(cursor, Ordering::Relaxed);
        info!(
            "exynos-snapshot: {} recovered, cursor {cursor:#x}",
            item.name
        );
    } else {
        item_raw.fill(0, item.size, 0);
        hdr.set_last_logbuf(item.paddr);
    }
}

/// All snapshot state: the reserved region, item table, rings and switches.
///
/// Construct once with [`ContextBuilder`]. Recorders take `&self` and are safe
/// to call from any thread.
pub struct DiagnosticsContext {
    pub(crate) config: Config,
    enabled: AtomicBool,
    region: Option<ReservedRegion>,
    pub(crate) items: Vec<Item>,
    pub(crate) header: Option<Header>,
    pub(crate) kevents: Option<KeventsView>,
    categories: [AtomicBool; Category::COUNT],
    callstack: AtomicUsize,
    hardlockup: AtomicBool,
    pub(crate) filters: Filters,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) snapshotter: Arc<dyn CpuStateSnapshotter>,
    pub(crate) platform: Arc<dyn PlatformHooks>,
    pub(crate) stats: RecorderStats,
    pub(crate) pmsg: Mutex<PmsgLogger>,
    pub(crate) crash_key: Mutex<CrashKey>,
}

impl DiagnosticsContext {
    /// Base switch. Off when boot failed or someone disabled "base".
    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Rings for `category`, if every switch on the path is on.
    #[inline(always)]
    pub(crate) fn kevents_for(&self, category: Category) -> Option<&KeventsView> {
        let kevents = self.kevents.as_ref()?;
        if !self.is_enabled()
            || !self.items[0].enabled()
            || !self.categories[category.index()].load(Ordering::Relaxed)
        {
            return None;
        }
        Some(kevents)
    }

    /// Header block, if the framework is enabled.
    pub(crate) fn live_header(&self) -> Option<&Header> {
        if !self.is_enabled() {
            return None;
        }
        self.header.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nr_cpus(&self) -> usize {
        self.config.boot.nr_cpus
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Live view of the rings, for the dumper.
    pub fn kevents(&self) -> Option<&KeventsView> {
        self.kevents.as_ref()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item(&self, name: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.name == name)
    }

    /// The placed item table, in placement order.
    pub fn layout(&self) -> Vec<ItemInfo> {
        self.items
            .iter()
            .map(|i| ItemInfo {
                name: i.name.clone(),
                paddr: i.paddr,
                size: i.size as u64,
                enabled: i.enabled(),
                persist: i.persist,
            })
            .collect()
    }

    /// Size of a placed item.
    pub fn item_size(&self, name: &str) -> Option<usize> {
        self.item(name).filter(|i| i.enabled_init).map(|i| i.size)
    }

    /// Physical base of a placed item.
    pub fn item_paddr(&self, name: &str) -> Option<u64> {
        self.item(name).filter(|i| i.enabled_init).map(|i| i.paddr)
    }

    pub fn spare_vaddr(&self, offset: usize) -> Option<u64> {
        let kevents = self.items.first()?;
        (offset < header::SPARE_SIZE).then(|| kevents.vaddr + (header::SPARE + offset) as u64)
    }

    pub fn spare_paddr(&self, offset: usize) -> Option<u64> {
        let kevents = self.items.first()?;
        (offset < header::SPARE_SIZE).then(|| kevents.paddr + (header::SPARE + offset) as u64)
    }

    pub fn callstack_depth(&self) -> usize {
        self.callstack.load(Ordering::Relaxed)
    }

    /// Depth is kept within 1..=4; other values are rejected.
    pub fn set_callstack_depth(&self, depth: usize) -> bool {
        if (1..=CALLSTACK_MAX).contains(&depth) {
            self.callstack.store(depth, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn hardlockup(&self) -> bool {
        self.hardlockup.load(Ordering::Relaxed)
    }

    /// Only takes effect while the framework is enabled.
    pub fn set_hardlockup(&self, on: bool) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.hardlockup.store(on, Ordering::Relaxed);
        true
    }

    pub fn category_enabled(&self, category: Category) -> bool {
        self.categories[category.index()].load(Ordering::Relaxed)
    }

    /// Switch "base", an item or a category by name.
    pub fn set_enable(&self, name: &str, on: bool) -> Result<()> {
        if name == "base" {
            if self.region.is_none() && on {
                return Err(SnapshotError::Disabled);
            }
            self.enabled.store(on, Ordering::Relaxed);
            info!("exynos-snapshot: base {}", if on { "enabled" } else { "disabled" });
            return Ok(());
        }
        if let Some(item) = self.item(name) {
            item.set_enabled(on, self.clock.cpu_clock(0));
            info!(
                "exynos-snapshot: item {name} {}",
                if on { "enabled" } else { "disabled" }
            );
            return Ok(());
        }
        let category =
            Category::from_name(name).ok_or_else(|| SnapshotError::UnknownName(name.to_string()))?;
        let laid_out = self
            .kevents
            .as_ref()
            .is_some_and(|k| k.layout(category).is_some());
        if !laid_out {
            return Err(SnapshotError::CategoryAbsent(category.name()));
        }
        self.categories[category.index()].store(on, Ordering::Relaxed);
        Ok(())
    }

    /// Current switch state of "base", an item or a category.
    pub fn get_enable(&self, name: &str) -> Option<bool> {
        if name == "base" {
            return Some(self.is_enabled());
        }
        if let Some(item) = self.item(name) {
            return Some(item.enabled());
        }
        Category::from_name(name).map(|c| self.category_enabled(c))
    }

    /// Re-enable an item that has been off for at least `duration`.
    pub fn try_enable(&self, name: &str, duration: Duration) -> bool {
        let Some(item) = self.item(name) else {
            return false;
        };
        if !item.enabled_init || item.enabled() {
            return false;
        }
        let now = self.clock.cpu_clock(0);
        let off_for = now.saturating_sub(item.disabled_at_ns());
        if off_for >= duration.as_nanos() as u64 {
            item.set_enabled(true, now);
            info!("exynos-snapshot: item {name} re-enabled after {off_for} ns");
            true
        } else {
            false
        }
    }

    /// Push the region to its backing store.
    pub fn flush(&self) -> io::Result<()> {
        match &self.region {
            Some(region) => region.flush(),
            None => Ok(()),
        }
    }

    pub(crate) fn item_raw(&self, item: &Item) -> Option<RawRegion> {
        self.region.as_ref()?.raw().sub(item.offset, item.size)
    }

    pub(crate) fn fill_callstack(&self, frames: &[u64]) -> [u64; CALLSTACK_MAX] {
        let mut out = [0u64; CALLSTACK_MAX];
        let n = frames.len().min(self.callstack_depth());
        out[..n].copy_from_slice(&frames[..n]);
        out
    }
}

impl Drop for DiagnosticsContext {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("exynos-snapshot: flush on teardown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ItemConfig;
    use crate::region::AnonymousReserver;

    pub(crate) fn small_config() -> Config {
        let mut cfg = Config::default();
        cfg.boot.nr_cpus = 2;
        cfg.boot.minimized = true;
        cfg.items = vec![
            ItemConfig {
                name: KEVENTS_ITEM.into(),
                size: 2 * 1024 * 1024,
                persist: false,
                enabled: true,
            },
            ItemConfig {
                name: KERNEL_ITEM.into(),
                size: 64 * 1024,
                persist: false,
                enabled: true,
            },
            ItemConfig {
                name: "log_pstore".into(),
                size: 64 * 1024,
                persist: true,
                enabled: true,
            },
        ];
        cfg
    }

    #[test]
    fn parses_base_address_forms() {
        assert_eq!(parse_base_address(Some("0x90000000")).unwrap(), 0x9000_0000);
        assert_eq!(parse_base_address(Some("2415919104")).unwrap(), 0x9000_0000);
        assert_eq!(parse_base_address(Some("010")).unwrap(), 8);
        assert!(matches!(
            parse_base_address(None),
            Err(SnapshotError::NoBaseAddress)
        ));
        assert!(matches!(
            parse_base_address(Some("  ")),
            Err(SnapshotError::NoBaseAddress)
        ));
        assert!(matches!(
            parse_base_address(Some("0xzz")),
            Err(SnapshotError::InvalidBaseAddress(_))
        ));
    }

    #[test]
    fn boot_places_items_and_writes_header() {
        let ctx = ContextBuilder::new(small_config())
            .boot(&mut AnonymousReserver::new(), Some("0x90000000"));
        assert!(ctx.is_enabled());
        assert_eq!(ctx.item_paddr(KEVENTS_ITEM), Some(0x9000_0000));
        assert_eq!(ctx.item_paddr(KERNEL_ITEM), Some(0x9020_0000));
        assert_eq!(ctx.item_size("log_pstore"), Some(64 * 1024));
        assert_eq!(ctx.item_size("log_etm"), None);
        let layout = ctx.layout();
        assert_eq!(layout[0].name, KEVENTS_ITEM);
        assert_eq!(layout[1].paddr, 0x9020_0000);
        assert_eq!(ctx.header().unwrap().item_table(), layout);

        let hdr = ctx.header().unwrap();
        assert!(hdr.magic_ok());
        assert_eq!(hdr.base().paddr, 0x9000_0000);
        assert_eq!(hdr.scratch(), sign::SCRATCH);
        assert_eq!(hdr.core_power_stat(1), sign::ALIVE);
        let table = hdr.item_table();
        assert_eq!(table.len(), 3);
        assert_eq!(table[2].name, "log_pstore");
        assert!(table[2].persist);

        assert_eq!(ctx.spare_paddr(0x10), Some(0x9000_3010));
        assert_eq!(ctx.spare_paddr(header::SPARE_SIZE), None);
    }

    #[test]
    fn missing_base_disables_everything() {
        let ctx = ContextBuilder::new(small_config()).boot(&mut AnonymousReserver::new(), None);
        assert!(!ctx.is_enabled());
        assert!(ctx.kevents().is_none());
        assert!(ctx.item_size(KEVENTS_ITEM).is_none());
        assert!(!ctx.set_hardlockup(true));
        assert!(matches!(
            ctx.set_enable("base", true),
            Err(SnapshotError::Disabled)
        ));
    }

    #[test]
    fn refused_reservation_disables_everything() {
        let ctx = ContextBuilder::new(small_config())
            .boot(&mut AnonymousReserver::with_limit(4096), Some("0x90000000"));
        assert!(!ctx.is_enabled());
        assert!(ctx.header().is_none());
    }

    #[test]
    fn try_boot_reports_invalid_config() {
        let mut cfg = small_config();
        cfg.categories.callstack = 9;
        let err = ContextBuilder::new(cfg)
            .try_boot(&mut AnonymousReserver::new(), Some("0x90000000"))
            .err()
            .unwrap()
            .1;
        assert!(matches!(err, SnapshotError::Config(_)));
    }

    #[test]
    fn switches_by_name() {
        let ctx = ContextBuilder::new(small_config())
            .boot(&mut AnonymousReserver::new(), Some("0x90000000"));
        assert_eq!(ctx.get_enable("irq"), Some(true));
        ctx.set_enable("irq", false).unwrap();
        assert_eq!(ctx.get_enable("irq"), Some(false));
        ctx.set_enable(KERNEL_ITEM, false).unwrap();
        assert_eq!(ctx.get_enable(KERNEL_ITEM), Some(false));
        assert_eq!(ctx.get_enable("nope"), None);
        assert!(matches!(
            ctx.set_enable("nope", true),
            Err(SnapshotError::UnknownName(_))
        ));
    }

    #[test]
    fn try_enable_waits_for_duration() {
        let clock = Arc::new(ManualClock::new(1_000));
        let ctx = ContextBuilder::new(small_config())
            .clock(clock.clone())
            .boot(&mut AnonymousReserver::new(), Some("0x90000000"));
        ctx.set_enable(KERNEL_ITEM, false).unwrap();
        clock.advance(500);
        assert!(!ctx.try_enable(KERNEL_ITEM, Duration::from_nanos(1_000)));
        clock.advance(500);
        assert!(ctx.try_enable(KERNEL_ITEM, Duration::from_nanos(1_000)));
        assert_eq!(ctx.get_enable(KERNEL_ITEM), Some(true));
        assert!(!ctx.try_enable(KERNEL_ITEM, Duration::ZERO));
    }

    #[test]
    fn callstack_depth_bounds() {
        let ctx = ContextBuilder::new(small_config())
            .boot(&mut AnonymousReserver::new(), Some("0x90000000"));
        assert_eq!(ctx.callstack_depth(), 4);
        assert!(!ctx.set_callstack_depth(0));
        assert!(!ctx.set_callstack_depth(5));
        assert!(ctx.set_callstack_depth(2));
        assert_eq!(ctx.fill_callstack(&[1, 2, 3]), [1, 2, 0, 0]);
    }

    #[test]
    fn disabled_kevents_item_has_no_rings() {
        let mut cfg = small_config();
        cfg.items[0].enabled = false;
        let ctx = ContextBuilder::new(cfg).boot(&mut AnonymousReserver::new(), Some("0x90000000"));
        assert!(ctx.is_enabled());
        assert!(ctx.kevents().is_none());
        assert_eq!(ctx.items()[0].size, header::ALLOC_SIZE);
        assert!(ctx.header().unwrap().magic_ok());
    }
}
