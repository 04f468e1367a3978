//! Offline access to a preserved region image.
//!
//! The image is mapped copy-on-write, so nothing done through the view ever
//! reaches the file.

use std::fs::File;
use std::path::Path;

use exynos_ss_common::{HeaderBase, MAX_CPUS, header, sign};
use memmap2::{MmapMut, MmapOptions};
use serde::Serialize;

use crate::config::KEVENTS_ITEM;
use crate::error::{Result, SnapshotError};
use crate::layout::{Header, ItemInfo};
use crate::region::RawRegion;
use crate::ring::KeventsView;

/// Per-CPU crash markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuStatus {
    pub cpu: usize,
    pub power: &'static str,
    pub panic: &'static str,
}

/// What the header says about how the previous run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageStatus {
    pub scratch: &'static str,
    pub reason: &'static str,
    pub panic_string: String,
    pub cpus: Vec<CpuStatus>,
}

pub struct SnapshotImage {
    _map: MmapMut,
    raw: RawRegion,
    header: Header,
    base: HeaderBase,
    items: Vec<ItemInfo>,
    kevents: Option<KeventsView>,
}

impl SnapshotImage {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < header::TOTAL_SIZE {
            return Err(SnapshotError::MalformedImage(format!(
                "{} is {len:#x} bytes, smaller than a header",
                path.display()
            )));
        }
        // SAFETY: private copy-on-write mapping; concurrent changes to the
        // file may show through but cannot make the mapping invalid.
        let mut map = unsafe { MmapOptions::new().map_copy(&file) }?;
        // SAFETY: `map` is stored alongside `raw` and outlives it.
        let raw = unsafe { RawRegion::from_raw(map.as_mut_ptr(), map.len()) };

        let hdr = Header::new(raw);
        if !hdr.magic_ok() {
            return Err(SnapshotError::MalformedImage(format!(
                "header magic {:#x}",
                hdr.base().magic
            )));
        }
        let base = hdr.base();
        let items = hdr.item_table();
        let kevents = match items.first() {
            Some(first) if first.name == KEVENTS_ITEM && first.enabled => {
                let size = (first.size as usize).min(len);
                let region = raw
                    .sub(0, size)
                    .ok_or_else(|| SnapshotError::MalformedImage("kevents item".into()))?;
                Some(KeventsView::parse(region)?)
            }
            _ => None,
        };

        Ok(Self {
            _map: map,
            raw,
            header: hdr,
            base,
            items,
            kevents,
        })
    }

    pub fn base(&self) -> HeaderBase {
        self.base
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn items(&self) -> &[ItemInfo] {
        &self.items
    }

    pub fn kevents(&self) -> Option<&KeventsView> {
        self.kevents.as_ref()
    }

    /// Raw bytes of an item, by name.
    pub fn item_bytes(&self, name: &str) -> Option<Vec<u8>> {
        let item = self.items.iter().find(|i| i.name == name)?;
        let offset = usize::try_from(item.paddr.checked_sub(self.base.paddr)?).ok()?;
        let region = self.raw.sub(offset, item.size as usize)?;
        let mut out = vec![0u8; region.len()];
        region.copy_to(0, &mut out);
        Some(out)
    }

    pub fn status(&self) -> ImageStatus {
        ImageStatus {
            scratch: sign::name(self.header.scratch()),
            reason: sign::name(self.header.emergency_reason()),
            panic_string: self.header.panic_string(),
            cpus: (0..MAX_CPUS)
                .map(|cpu| CpuStatus {
                    cpu,
                    power: sign::name(self.header.core_power_stat(cpu)),
                    panic: sign::name(self.header.core_panic_stat(cpu)),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KERNEL_ITEM};
    use crate::context::ContextBuilder;
    use crate::region::FileReserver;
    use exynos_ss_common::{Category, CoreRegisters};
    use std::io::Write;

    #[test]
    fn reads_back_a_crashed_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ess.img");
        {
            let mut cfg = Config::default();
            cfg.boot.nr_cpus = 2;
            cfg.boot.minimized = true;
            cfg.items.truncate(2);
            let ctx = ContextBuilder::new(cfg)
                .boot(&mut FileReserver::new(&path), Some("0x90000000"));
            ctx.task(1, 0x42, "swapper/1");
            ctx.hook_logbuf(b"<0>Kernel panic\n");
            ctx.dump_panic("Fatal exception in interrupt");
            ctx.report_reason(sign::PANIC);
            let frame = CoreRegisters {
                pc: 0xabc,
                ..Default::default()
            };
            ctx.save_context(1, Some(&frame));
        }

        let image = SnapshotImage::open(&path).unwrap();
        assert_eq!(image.base().paddr, 0x9000_0000);
        assert_eq!(image.items().len(), 2);
        assert_eq!(image.header().core_registers(1).pc, 0xabc);

        let status = image.status();
        assert_eq!(status.reason, "PANIC");
        assert_eq!(status.scratch, "SCRATCH");
        assert_eq!(status.panic_string, "Fatal exception in interrupt");
        assert_eq!(status.cpus[1].panic, "PANIC");
        assert_eq!(status.cpus[0].power, "ALIVE");

        let kevents = image.kevents().unwrap();
        assert_eq!(kevents.write_index(Category::Task, 1), Some(0));
        let kernel = image.item_bytes(KERNEL_ITEM).unwrap();
        assert!(kernel.starts_with(b"<0>Kernel panic\n"));
    }

    #[test]
    fn rejects_foreign_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0xAAu8; header::TOTAL_SIZE]).unwrap();
        assert!(matches!(
            SnapshotImage::open(file.path()),
            Err(SnapshotError::MalformedImage(_))
        ));
    }

    #[test]
    fn rejects_short_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            SnapshotImage::open(file.path()),
            Err(SnapshotError::MalformedImage(_))
        ));
    }
}
