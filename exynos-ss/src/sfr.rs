//! Special function register dump into `log_sfr` at panic time.

use log::{error, info};

use crate::config::{SFR_ITEM, SfrDumpGroup};
use crate::context::DiagnosticsContext;

const END_MARKERS: [u64; 2] = [0, 0xFFFF_FFFF];

impl DiagnosticsContext {
    /// Sample every configured register group as `0xADDR = 0xVAL` lines.
    /// Returns the number of registers written.
    pub fn dump_sfr(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let item = match self.item(SFR_ITEM) {
            Some(item) if item.enabled() && !self.config.sfr_dump.is_empty() => item,
            _ => {
                info!("exynos-snapshot: dump_sfr: no information");
                return 0;
            }
        };
        let mut dumped = 0;
        for group in &self.config.sfr_dump {
            dumped += self.dump_sfr_group(&item.name, group);
            info!("exynos-snapshot: complete to dump {}", group.name);
        }
        dumped
    }

    fn dump_sfr_group(&self, item: &str, group: &SfrDumpGroup) -> usize {
        let mut dumped = 0;
        for &addr in &group.addrs {
            if END_MARKERS.contains(&addr) {
                break;
            }
            if addr < group.base || addr - group.base >= group.size {
                error!(
                    "exynos-snapshot: invalid address information - {}: {addr:#010x}",
                    group.name
                );
                break;
            }
            let Some(val) = self.platform.read_sfr(addr) else {
                continue;
            };
            self.hook_logger(item, format!("0x{addr:X} = 0x{val:X}\n").as_bytes());
            self.stats.inc_sfr_register();
            dumped += 1;
        }
        dumped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{Config, ItemConfig, KEVENTS_ITEM};
    use crate::context::ContextBuilder;
    use crate::platform::PlatformHooks;
    use crate::region::AnonymousReserver;

    struct Sfrs;

    impl PlatformHooks for Sfrs {
        fn read_sfr(&self, paddr: u64) -> Option<u32> {
            (paddr != 0x1040_0008).then_some(paddr as u32 ^ 0xFFFF)
        }
    }

    fn boot(groups: Vec<SfrDumpGroup>) -> DiagnosticsContext {
        let mut cfg = Config::default();
        cfg.boot.nr_cpus = 1;
        cfg.boot.minimized = true;
        cfg.items = vec![
            ItemConfig {
                name: KEVENTS_ITEM.into(),
                size: 2 * 1024 * 1024,
                persist: false,
                enabled: true,
            },
            ItemConfig {
                name: SFR_ITEM.into(),
                size: 4096,
                persist: false,
                enabled: true,
            },
        ];
        cfg.sfr_dump = groups;
        ContextBuilder::new(cfg)
            .platform(Arc::new(Sfrs))
            .boot(&mut AnonymousReserver::new(), Some("0x80000000"))
    }

    fn group(addrs: Vec<u64>) -> SfrDumpGroup {
        SfrDumpGroup {
            name: "pmu".into(),
            base: 0x1040_0000,
            size: 0x1000,
            pwr_mode: None,
            addrs,
        }
    }

    #[test]
    fn dumps_until_end_marker() {
        let ctx = boot(vec![group(vec![
            0x1040_0000,
            0x1040_0004,
            0x1040_0008,
            0,
            0x1040_000C,
        ])]);
        assert_eq!(ctx.dump_sfr(), 2);
        let text = String::from_utf8(ctx.mirrored(SFR_ITEM).unwrap()).unwrap();
        assert_eq!(text, "0x10400000 = 0x1040FFFF\n0x10400004 = 0x1040FFFB\n");
        assert_eq!(ctx.stats().sfr_registers(), 2);
    }

    #[test]
    fn out_of_range_address_ends_group() {
        let ctx = boot(vec![group(vec![0x1040_0000, 0x1041_0000, 0x1040_0004])]);
        assert_eq!(ctx.dump_sfr(), 1);
    }

    #[test]
    fn nothing_configured() {
        let ctx = boot(Vec::new());
        assert_eq!(ctx.dump_sfr(), 0);
    }
}
