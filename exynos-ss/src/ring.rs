//! Per-category ring buffers inside the `log_kevents` item.
//!
//! # Layout
//!
//! After the fixed header comes a self-describing directory followed by, for
//! each laid-out category, a table of per-shard write indices and the record
//! arrays themselves (shard-major). Offline readers parse the directory, so
//! they need nothing from the writer's configuration.
//!
//! ```text
//! +----------------------+ header::TOTAL_SIZE
//! | KeventsDirectory     |
//! | DirectoryEntry[n]    |
//! +----------------------+ 64-byte aligned from here on
//! | i64 index[shards]    |  category 0
//! | T records[shards][N] |
//! +----------------------+
//! | ...                  |  category 1..n
//! +----------------------+
//! ```
//!
//! # Write discipline
//!
//! The index is the only synchronisation. A writer does one `fetch_add` and
//! then stores the payload without further ordering. Per-CPU categories have
//! one index per CPU so writers never share slots; global categories can, in
//! principle, have two writers land on the same slot when the ring wraps within
//! one payload write. That race is accepted: the rings are best-effort
//! diagnostics and a lock here could deadlock against the locks being traced.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};

use exynos_ss_common::{
    Category, DirectoryEntry, KEVENTS_MAGIC, KEVENTS_VERSION, KeventsDirectory, LogRecord,
    MAX_CPUS, header,
};

use crate::error::{Result, SnapshotError};
use crate::region::RawRegion;

const RING_ALIGN: usize = 64;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Where one category's rings live, relative to the kevents item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub category: Category,
    pub shards: usize,
    pub capacity: usize,
    pub record_size: usize,
    pub index_offset: usize,
    pub data_offset: usize,
}

impl RingLayout {
    #[inline(always)]
    pub fn mask(&self) -> usize {
        self.capacity - 1
    }

    fn data_bytes(&self) -> usize {
        self.shards * self.capacity * self.record_size
    }

    #[inline(always)]
    fn slot_offset(&self, shard: usize, slot: usize) -> usize {
        self.data_offset + (shard * self.capacity + (slot & self.mask())) * self.record_size
    }

    fn to_entry(self) -> DirectoryEntry {
        DirectoryEntry {
            category: self.category as u32,
            shards: self.shards as u32,
            capacity: self.capacity as u32,
            record_size: self.record_size as u32,
            index_offset: self.index_offset as u64,
            data_offset: self.data_offset as u64,
        }
    }
}

/// One category to lay out: shard count and per-shard capacity.
#[derive(Debug, Clone, Copy)]
pub struct RingPlan {
    pub category: Category,
    pub shards: usize,
    pub capacity: usize,
}

/// All rings of a kevents item, live or from a preserved image.
#[derive(Debug, Clone)]
pub struct KeventsView {
    region: RawRegion,
    rings: [Option<RingLayout>; Category::COUNT],
}

impl KeventsView {
    /// Lay out `plan` in `region`, write the directory and reset every index to -1.
    pub fn format(region: RawRegion, plan: &[RingPlan]) -> Result<Self> {
        let dir_offset = header::TOTAL_SIZE;
        let dir_bytes =
            size_of::<KeventsDirectory>() + plan.len() * size_of::<DirectoryEntry>();
        let mut cursor = align_up(dir_offset + dir_bytes, RING_ALIGN);
        let mut rings = [None; Category::COUNT];

        for p in plan {
            if !p.capacity.is_power_of_two() || p.shards == 0 || p.shards > MAX_CPUS {
                return Err(SnapshotError::Config(format!(
                    "bad ring shape for {}: {} shards x {}",
                    p.category.name(),
                    p.shards,
                    p.capacity
                )));
            }
            if rings[p.category.index()].is_some() {
                return Err(SnapshotError::Config(format!(
                    "{} planned twice",
                    p.category.name()
                )));
            }
            let index_offset = cursor;
            let data_offset = align_up(index_offset + p.shards * size_of::<i64>(), RING_ALIGN);
            let layout = RingLayout {
                category: p.category,
                shards: p.shards,
                capacity: p.capacity,
                record_size: p.category.record_size(),
                index_offset,
                data_offset,
            };
            cursor = align_up(data_offset + layout.data_bytes(), RING_ALIGN);
            rings[p.category.index()] = Some(layout);
        }

        if cursor > region.len() {
            return Err(SnapshotError::Config(format!(
                "rings need {cursor:#x} bytes, kevents item has {:#x}",
                region.len()
            )));
        }

        region.write(
            dir_offset,
            KeventsDirectory {
                magic: KEVENTS_MAGIC,
                version: KEVENTS_VERSION,
                count: plan.len() as u32,
                _pad: 0,
            },
        );
        let mut entry_offset = dir_offset + size_of::<KeventsDirectory>();
        for layout in rings.iter().flatten() {
            region.write(entry_offset, layout.to_entry());
            entry_offset += size_of::<DirectoryEntry>();
        }

        let view = Self { region, rings };
        for layout in view.rings() {
            for shard in 0..layout.shards {
                if let Some(idx) = view.index_atomic(layout, shard) {
                    idx.store(-1, Ordering::Relaxed);
                }
            }
        }
        Ok(view)
    }

    /// Rebuild the view from a directory already present in `region`.
    pub fn parse(region: RawRegion) -> Result<Self> {
        let dir_offset = header::TOTAL_SIZE;
        let dir: KeventsDirectory = region.read(dir_offset);
        if dir.magic != KEVENTS_MAGIC {
            return Err(SnapshotError::MalformedImage(format!(
                "kevents directory magic {:#x}",
                dir.magic
            )));
        }
        if dir.version != KEVENTS_VERSION {
            return Err(SnapshotError::MalformedImage(format!(
                "unsupported kevents version {}",
                dir.version
            )));
        }
        if dir.count as usize > Category::COUNT {
            return Err(SnapshotError::MalformedImage(format!(
                "{} directory entries",
                dir.count
            )));
        }

        let mut rings = [None; Category::COUNT];
        let mut entry_offset = dir_offset + size_of::<KeventsDirectory>();
        for _ in 0..dir.count {
            let entry: DirectoryEntry = region.read(entry_offset);
            entry_offset += size_of::<DirectoryEntry>();
            let layout = validate_entry(&entry, region.len())?;
            let slot = &mut rings[layout.category.index()];
            if slot.is_some() {
                return Err(SnapshotError::MalformedImage(format!(
                    "category {} listed twice",
                    layout.category.name()
                )));
            }
            *slot = Some(layout);
        }
        Ok(Self { region, rings })
    }

    pub fn region(&self) -> RawRegion {
        self.region
    }

    pub fn layout(&self, category: Category) -> Option<&RingLayout> {
        self.rings[category.index()].as_ref()
    }

    /// Laid-out categories in id order.
    pub fn rings(&self) -> impl Iterator<Item = &RingLayout> {
        self.rings.iter().flatten()
    }

    fn index_atomic(&self, layout: &RingLayout, shard: usize) -> Option<&AtomicI64> {
        if shard >= layout.shards {
            return None;
        }
        self.region
            .atomic_i64(layout.index_offset + shard * size_of::<i64>())
    }

    /// Raw write index of a shard; -1 until the first record.
    pub fn write_index(&self, category: Category, shard: usize) -> Option<i64> {
        let layout = self.layout(category)?;
        self.index_atomic(layout, shard)
            .map(|idx| idx.load(Ordering::Relaxed))
    }

    /// Read the record at `slot` (masked) of a shard.
    pub fn load<T: LogRecord>(&self, shard: usize, slot: usize) -> Option<T> {
        let layout = self.layout(T::CATEGORY)?;
        if shard >= layout.shards || layout.record_size != size_of::<T>() {
            return None;
        }
        Some(self.region.read(layout.slot_offset(shard, slot)))
    }

    /// Typed handle for writers.
    #[inline]
    pub fn ring<T: LogRecord>(&self) -> Option<Ring<'_, T>> {
        let layout = self.layout(T::CATEGORY)?;
        if layout.record_size != size_of::<T>() {
            return None;
        }
        Some(Ring {
            view: self,
            layout,
            _record: PhantomData,
        })
    }
}

fn validate_entry(entry: &DirectoryEntry, len: usize) -> Result<RingLayout> {
    let category = Category::from_id(entry.category).ok_or_else(|| {
        SnapshotError::MalformedImage(format!("unknown category id {}", entry.category))
    })?;
    let bad = |what: &str| {
        SnapshotError::MalformedImage(format!("{}: {what}", category.name()))
    };
    if entry.record_size as usize != category.record_size() {
        return Err(bad("record size mismatch"));
    }
    if entry.capacity == 0 || !entry.capacity.is_power_of_two() {
        return Err(bad("capacity not a power of two"));
    }
    if entry.shards == 0 || entry.shards as usize > MAX_CPUS {
        return Err(bad("shard count out of range"));
    }
    let layout = RingLayout {
        category,
        shards: entry.shards as usize,
        capacity: entry.capacity as usize,
        record_size: entry.record_size as usize,
        index_offset: usize::try_from(entry.index_offset).map_err(|_| bad("index offset"))?,
        data_offset: usize::try_from(entry.data_offset).map_err(|_| bad("data offset"))?,
    };
    if layout.index_offset % size_of::<i64>() != 0
        || layout.index_offset + layout.shards * size_of::<i64>() > len
    {
        return Err(bad("index table out of range"));
    }
    let end = layout
        .data_offset
        .checked_add(layout.data_bytes())
        .ok_or_else(|| bad("ring overflows"))?;
    if end > len {
        return Err(bad("ring out of range"));
    }
    Ok(layout)
}

/// Typed writer handle onto one category.
pub struct Ring<'a, T> {
    view: &'a KeventsView,
    layout: &'a RingLayout,
    _record: PhantomData<T>,
}

impl<T: LogRecord> Ring<'_, T> {
    #[inline(always)]
    pub fn shards(&self) -> usize {
        self.layout.shards
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Claim the next index on `shard`. The first claim after format yields 0.
    #[inline(always)]
    pub fn claim(&self, shard: usize) -> Option<i64> {
        let idx = self.view.index_atomic(self.layout, shard)?;
        Some(idx.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    /// Undo the last claim on `shard` so a rejected record leaves no hole.
    #[inline(always)]
    pub fn rollback(&self, shard: usize) {
        if let Some(idx) = self.view.index_atomic(self.layout, shard) {
            idx.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Store a payload at a claimed index.
    #[inline(always)]
    pub fn store(&self, shard: usize, index: i64, record: T) {
        let slot = index as usize & self.layout.mask();
        self.view
            .region
            .write(self.layout.slot_offset(shard, slot), record);
    }

    /// Claim and store in one go.
    #[inline(always)]
    pub fn push(&self, shard: usize, record: T) -> Option<i64> {
        let index = self.claim(shard)?;
        self.store(shard, index, record);
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{AnonymousReserver, MemoryReserver};
    use bytemuck::Zeroable;
    use exynos_ss_common::{IrqLog, TaskLog};

    fn plan() -> Vec<RingPlan> {
        vec![
            RingPlan {
                category: Category::Task,
                shards: 2,
                capacity: 8,
            },
            RingPlan {
                category: Category::Irq,
                shards: 2,
                capacity: 16,
            },
        ]
    }

    #[test]
    fn format_then_parse_agree() {
        let region = AnonymousReserver::new().reserve(0, 256 * 1024).unwrap();
        let live = KeventsView::format(region.raw(), &plan()).unwrap();
        let parsed = KeventsView::parse(region.raw()).unwrap();
        assert_eq!(
            live.layout(Category::Task),
            parsed.layout(Category::Task)
        );
        assert_eq!(live.layout(Category::Irq), parsed.layout(Category::Irq));
        assert!(parsed.layout(Category::Printk).is_none());
        assert_eq!(parsed.write_index(Category::Task, 1), Some(-1));
    }

    #[test]
    fn rings_do_not_overlap() {
        let region = AnonymousReserver::new().reserve(0, 256 * 1024).unwrap();
        let view = KeventsView::format(region.raw(), &plan()).unwrap();
        let mut spans: Vec<(usize, usize)> = view
            .rings()
            .flat_map(|l| {
                [
                    (l.index_offset, l.index_offset + l.shards * 8),
                    (l.data_offset, l.data_offset + l.data_bytes()),
                ]
            })
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{pair:?}");
        }
        assert!(spans[0].0 >= header::TOTAL_SIZE);
    }

    #[test]
    fn claim_wraps_with_mask() {
        let region = AnonymousReserver::new().reserve(0, 256 * 1024).unwrap();
        let view = KeventsView::format(region.raw(), &plan()).unwrap();
        let ring = view.ring::<TaskLog>().unwrap();
        for i in 0..9u64 {
            let mut rec = TaskLog::zeroed();
            rec.time = i;
            assert_eq!(ring.push(0, rec), Some(i as i64));
        }
        // the ninth record overwrote slot 0
        assert_eq!(view.load::<TaskLog>(0, 0).unwrap().time, 8);
        assert_eq!(view.load::<TaskLog>(0, 1).unwrap().time, 1);
        assert_eq!(view.write_index(Category::Task, 0), Some(8));
        assert_eq!(view.write_index(Category::Task, 1), Some(-1));
    }

    #[test]
    fn rollback_restores_index() {
        let region = AnonymousReserver::new().reserve(0, 256 * 1024).unwrap();
        let view = KeventsView::format(region.raw(), &plan()).unwrap();
        let ring = view.ring::<IrqLog>().unwrap();
        ring.push(1, IrqLog::zeroed());
        assert_eq!(ring.claim(1), Some(1));
        ring.rollback(1);
        assert_eq!(view.write_index(Category::Irq, 1), Some(0));
        assert!(ring.claim(2).is_none());
    }

    #[test]
    fn format_rejects_oversized_plan() {
        let region = AnonymousReserver::new().reserve(0, 64 * 1024).unwrap();
        let big = [RingPlan {
            category: Category::Printk,
            shards: 1,
            capacity: 2048,
        }];
        assert!(matches!(
            KeventsView::format(region.raw(), &big),
            Err(SnapshotError::Config(_))
        ));
    }

    #[test]
    fn parse_rejects_garbage() {
        let region = AnonymousReserver::new().reserve(0, 64 * 1024).unwrap();
        assert!(matches!(
            KeventsView::parse(region.raw()),
            Err(SnapshotError::MalformedImage(_))
        ));
    }
}
