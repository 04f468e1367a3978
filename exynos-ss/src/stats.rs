use std::sync::atomic::{AtomicU64, Ordering};

use exynos_ss_common::Category;

/// Counters for the snapshot engine.
///
/// Updated from recorder hot paths, so everything is a relaxed atomic.
pub struct RecorderStats {
    records_by_category: [AtomicU64; Category::COUNT],
    filtered: AtomicU64,
    below_threshold: AtomicU64,
    captures: AtomicU64,
    captures_skipped: AtomicU64,
    hook_bytes: AtomicU64,
    sfr_registers: AtomicU64,
}

impl RecorderStats {
    pub fn new() -> Self {
        Self {
            records_by_category: std::array::from_fn(|_| AtomicU64::new(0)),
            filtered: AtomicU64::new(0),
            below_threshold: AtomicU64::new(0),
            captures: AtomicU64::new(0),
            captures_skipped: AtomicU64::new(0),
            hook_bytes: AtomicU64::new(0),
            sfr_registers: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc_record(&self, category: Category) {
        self.records_by_category[category.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_below_threshold(&self) {
        self.below_threshold.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_capture(&self) {
        self.captures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_capture_skipped(&self) {
        self.captures_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_hook_bytes(&self, n: usize) {
        self.hook_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_sfr_register(&self) {
        self.sfr_registers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records(&self, category: Category) -> u64 {
        self.records_by_category[category.index()].load(Ordering::Relaxed)
    }

    pub fn records_total(&self) -> u64 {
        self.records_by_category
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Dropped by an exclusion list.
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Dropped by the irq-exit latency threshold.
    pub fn below_threshold(&self) -> u64 {
        self.below_threshold.load(Ordering::Relaxed)
    }

    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    pub fn captures_skipped(&self) -> u64 {
        self.captures_skipped.load(Ordering::Relaxed)
    }

    pub fn hook_bytes(&self) -> u64 {
        self.hook_bytes.load(Ordering::Relaxed)
    }

    pub fn sfr_registers(&self) -> u64 {
        self.sfr_registers.load(Ordering::Relaxed)
    }

    /// Non-zero per-category record counts.
    pub fn records_by_category(&self) -> Vec<(Category, u64)> {
        Category::ALL
            .iter()
            .map(|&c| (c, self.records(c)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

impl Default for RecorderStats {
    fn default() -> Self {
        Self::new()
    }
}
