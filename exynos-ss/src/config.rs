use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use exynos_ss_common::{CALLSTACK_MAX, Category, ITEM_MAX, MAX_CPUS};

use crate::error::{Result, SnapshotError};

const DEFAULT_CONFIG_PATH: &str = "/etc/exynos-ss/exynos-ss.toml";
const ENV_CONFIG_PATH: &str = "EXYNOS_SS_CONFIG";

/// Capacity of the irq and irq-exit exclusion lists.
pub const IRQ_EXLIST_MAX: usize = 8;
/// Capacity of the register range exclusion list.
pub const REG_EXLIST_MAX: usize = 9;
/// Granularity of register exclusion ranges added at runtime.
pub const REG_EXLIST_GRANULE: u64 = 4096;

pub const KEVENTS_ITEM: &str = "log_kevents";
pub const KERNEL_ITEM: &str = "log_kernel";
pub const PLATFORM_ITEM: &str = "log_platform";
pub const SFR_ITEM: &str = "log_sfr";
pub const PSTORE_ITEM: &str = "log_pstore";
pub const ETM_ITEM: &str = "log_etm";

const MIB: usize = 1024 * 1024;
const KEVENTS_SIZE: usize = 8 * MIB;
const KEVENTS_MINIMIZED_SIZE: usize = 2 * MIB;
const ITEM_NAME_MAX: usize = 15;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default = "default_items")]
    pub items: Vec<ItemConfig>,
    #[serde(default)]
    pub categories: CategoriesConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    /// Register groups sampled into `log_sfr` on panic.
    #[serde(default)]
    pub sfr_dump: Vec<SfrDumpGroup>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boot: BootConfig::default(),
            items: default_items(),
            categories: CategoriesConfig::default(),
            filters: FiltersConfig::default(),
            sfr_dump: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file. The path can be overridden
    /// with the `EXYNOS_SS_CONFIG` environment variable. If the file
    /// is missing or fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// Strict variant of [`Config::load`] for tooling: parse errors are reported.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| SnapshotError::Config(format!("{}: {e}", path.display())))
    }

    /// Item table as laid out, with the kevents size reduced in minimized mode.
    pub fn item_table(&self) -> Vec<ItemConfig> {
        self.items
            .iter()
            .map(|item| {
                let mut item = item.clone();
                if self.boot.minimized && item.name == KEVENTS_ITEM {
                    item.size = item.size.min(KEVENTS_MINIMIZED_SIZE);
                }
                item
            })
            .collect()
    }

    /// Ring capacity for a category after overrides. Minimized builds
    /// quarter the defaults so the rings fit the smaller kevents item.
    pub fn capacity(&self, category: Category) -> usize {
        match self.categories.capacity.get(category.name()) {
            Some(&capacity) => capacity,
            None if self.boot.minimized => (category.default_capacity() / 4).max(1),
            None => category.default_capacity(),
        }
    }

    pub fn category_enabled(&self, category: Category) -> bool {
        self.categories
            .enabled
            .iter()
            .any(|name| name == category.name())
    }

    pub fn validate(&self) -> Result<()> {
        let nr_cpus = self.boot.nr_cpus;
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err(SnapshotError::Config(format!(
                "nr_cpus must be 1..={MAX_CPUS}, got {nr_cpus}"
            )));
        }
        let depth = self.categories.callstack;
        if depth == 0 || depth > CALLSTACK_MAX {
            return Err(SnapshotError::Config(format!(
                "callstack must be 1..={CALLSTACK_MAX}, got {depth}"
            )));
        }

        match self.items.first() {
            Some(first) if first.name == KEVENTS_ITEM => {}
            _ => {
                return Err(SnapshotError::Config(format!(
                    "{KEVENTS_ITEM} must be the first item"
                )));
            }
        }
        if self.items.len() > ITEM_MAX {
            return Err(SnapshotError::Config(format!(
                "at most {ITEM_MAX} items, got {}",
                self.items.len()
            )));
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.name.is_empty() || item.name.len() > ITEM_NAME_MAX {
                return Err(SnapshotError::Config(format!(
                    "item name {:?} must be 1..={ITEM_NAME_MAX} bytes",
                    item.name
                )));
            }
            if !seen.insert(item.name.as_str()) {
                return Err(SnapshotError::Config(format!(
                    "duplicate item {:?}",
                    item.name
                )));
            }
            if !item.size.is_power_of_two() || item.size < 4096 {
                return Err(SnapshotError::Config(format!(
                    "item {:?} size {:#x} must be a power of two >= 4K",
                    item.name, item.size
                )));
            }
        }

        for name in &self.categories.enabled {
            if Category::from_name(name).is_none() {
                return Err(SnapshotError::UnknownName(name.clone()));
            }
        }
        for (name, capacity) in &self.categories.capacity {
            if Category::from_name(name).is_none() {
                return Err(SnapshotError::UnknownName(name.clone()));
            }
            if !capacity.is_power_of_two() {
                return Err(SnapshotError::Config(format!(
                    "capacity of {name} must be a power of two, got {capacity}"
                )));
            }
        }

        if self.filters.irq_exclude.len() > IRQ_EXLIST_MAX
            || self.filters.irq_exit_exclude.len() > IRQ_EXLIST_MAX
        {
            return Err(SnapshotError::Config(format!(
                "irq exclusion lists hold at most {IRQ_EXLIST_MAX} entries"
            )));
        }
        if self.filters.reg_exclude.len() > REG_EXLIST_MAX {
            return Err(SnapshotError::Config(format!(
                "register exclusion list holds at most {REG_EXLIST_MAX} entries"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BootConfig {
    #[serde(default = "default_nr_cpus")]
    pub nr_cpus: usize,
    /// Halt and hand over to the platform restart path after a panic.
    #[serde(default = "default_panic_reboot")]
    pub panic_reboot: bool,
    /// Whether a watchdog device is present to reset a stalled system.
    #[serde(default = "default_watchdog")]
    pub watchdog: bool,
    /// Shrink `log_kevents` for memory constrained targets.
    #[serde(default)]
    pub minimized: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            nr_cpus: default_nr_cpus(),
            panic_reboot: default_panic_reboot(),
            watchdog: default_watchdog(),
            minimized: false,
        }
    }
}

fn default_nr_cpus() -> usize {
    MAX_CPUS
}
fn default_panic_reboot() -> bool {
    true
}
fn default_watchdog() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ItemConfig {
    pub name: String,
    pub size: usize,
    /// Survives a warm reset; not cleared at boot.
    #[serde(default)]
    pub persist: bool,
    #[serde(default = "default_item_enabled")]
    pub enabled: bool,
}

impl ItemConfig {
    fn new(name: &str, size: usize, persist: bool) -> Self {
        Self {
            name: name.to_string(),
            size,
            persist,
            enabled: true,
        }
    }
}

fn default_item_enabled() -> bool {
    true
}

fn default_items() -> Vec<ItemConfig> {
    vec![
        ItemConfig::new(KEVENTS_ITEM, KEVENTS_SIZE, false),
        ItemConfig::new(KERNEL_ITEM, 2 * MIB, false),
        ItemConfig::new(PLATFORM_ITEM, 4 * MIB, false),
        ItemConfig::new(SFR_ITEM, 4 * MIB, false),
        ItemConfig::new(PSTORE_ITEM, 2 * MIB, true),
        ItemConfig::new(ETM_ITEM, 8 * MIB, true),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoriesConfig {
    #[serde(default = "default_enabled_categories")]
    pub enabled: Vec<String>,
    /// Per-category ring capacity overrides, keyed by category name.
    #[serde(default)]
    pub capacity: BTreeMap<String, usize>,
    #[serde(default = "default_callstack")]
    pub callstack: usize,
    /// Names of the DVFS domains indexed by freq records.
    #[serde(default = "default_freq_domains")]
    pub freq_domains: Vec<String>,
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_categories(),
            capacity: BTreeMap::new(),
            callstack: default_callstack(),
            freq_domains: default_freq_domains(),
        }
    }
}

fn default_enabled_categories() -> Vec<String> {
    Category::ALL.iter().map(|c| c.name().to_string()).collect()
}
fn default_callstack() -> usize {
    CALLSTACK_MAX
}
fn default_freq_domains() -> Vec<String> {
    ["APL", "ATL", "INT", "MIF", "ISP", "DISP", "INTCAM"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FiltersConfig {
    #[serde(default)]
    pub irq_exclude: Vec<u32>,
    #[serde(default)]
    pub irq_exit_exclude: Vec<u32>,
    #[serde(default = "default_irq_exit_threshold_us")]
    pub irq_exit_threshold_us: u32,
    #[serde(default)]
    pub reg_exclude: Vec<RegRange>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            irq_exclude: Vec::new(),
            irq_exit_exclude: Vec::new(),
            irq_exit_threshold_us: default_irq_exit_threshold_us(),
            reg_exclude: Vec::new(),
        }
    }
}

fn default_irq_exit_threshold_us() -> u32 {
    300
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RegRange {
    pub addr: u64,
    pub size: u64,
}

/// One named register dump group.
#[derive(Debug, Deserialize, Clone)]
pub struct SfrDumpGroup {
    pub name: String,
    /// Physical base of the register block.
    pub base: u64,
    pub size: u64,
    /// Power domain the block lives in; informational.
    #[serde(default)]
    pub pwr_mode: Option<u32>,
    /// Absolute register addresses, in dump order.
    #[serde(default)]
    pub addrs: Vec<u64>,
}
