//! Text attribute interface, one show/store pair per attribute.
//!
//! Stores are lenient: malformed or rejected input is logged and ignored,
//! and every store reports the whole input as consumed.

use exynos_ss_common::Category;
use log::{info, warn};

use crate::config::REG_EXLIST_GRANULE;
use crate::context::DiagnosticsContext;

pub const ATTRIBUTES: [&str; 6] = [
    "enabled",
    "callstack",
    "exlist_irqdisabled",
    "exlist_irqexit",
    "threshold_irqexit",
    "exlist_reg",
];

/// Leading unsigned integer of `s` with C base detection. Parsing stops at
/// the first character that is not a digit; no digits at all gives 0.
pub fn parse_ulong_lenient(s: &str) -> u64 {
    let s = s.trim_start();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    digits[..end]
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0u64, |acc, d| acc.wrapping_mul(u64::from(radix)).wrapping_add(u64::from(d)))
}

pub struct ControlSurface<'a> {
    ctx: &'a DiagnosticsContext,
}

impl<'a> ControlSurface<'a> {
    pub fn new(ctx: &'a DiagnosticsContext) -> Self {
        Self { ctx }
    }

    /// Render an attribute, or `None` if there is no such attribute.
    pub fn show(&self, attr: &str) -> Option<String> {
        let out = match attr {
            "enabled" => self.show_enabled(),
            "callstack" => format!("callstack depth : {}\n", self.ctx.callstack_depth()),
            "exlist_irqdisabled" => {
                let mut out = String::from("excluded irq number\n");
                for irq in self.ctx.filters().irq.entries() {
                    out += &format!("irq num: {irq:<4}\n");
                }
                out
            }
            "exlist_irqexit" => {
                let mut out = String::from("Excluded irq number\n");
                for irq in self.ctx.filters().irq_exit.entries() {
                    out += &format!("IRQ num: {irq:<4}\n");
                }
                out
            }
            "threshold_irqexit" => format!(
                "threshold : {:>12} us\n",
                self.ctx.filters().irq_exit_threshold_us()
            ),
            "exlist_reg" => {
                let mut out = String::from("excluded register address\n");
                for r in self.ctx.filters().reg.entries() {
                    out += &format!("register addr: {:08x} size: {:08x}\n", r.addr, r.size);
                }
                out
            }
            _ => return None,
        };
        Some(out)
    }

    fn show_enabled(&self) -> String {
        let state = |on: bool| if on { "enable" } else { "disable" };
        let mut out = String::new();
        for item in self.ctx.items() {
            out += &format!("{:<13} : {}\n", item.name, state(item.enabled()));
        }
        for &c in Category::ALL.iter() {
            if self.ctx.kevents().is_some_and(|k| k.layout(c).is_some()) {
                out += &format!("{:<13} : {}\n", c.name(), state(self.ctx.category_enabled(c)));
            }
        }
        out += &format!("{:<13} : {}\n", "base", state(self.ctx.is_enabled()));
        out
    }

    /// Apply `input` to an attribute. Always returns `input.len()`.
    pub fn store(&self, attr: &str, input: &str) -> usize {
        match attr {
            "enabled" => self.store_enabled(input),
            "callstack" => {
                let depth = parse_ulong_lenient(input);
                info!("exynos-snapshot: callstack depth(min 1, max 4) : {depth}");
                if self.ctx.set_callstack_depth(depth as usize) {
                    info!("exynos-snapshot: success inserting {depth} to callstack value");
                }
            }
            "exlist_irqdisabled" => self.store_irq(input, false),
            "exlist_irqexit" => self.store_irq(input, true),
            "threshold_irqexit" => {
                let us = parse_ulong_lenient(input);
                info!("exynos-snapshot: threshold value : {us}");
                if us != 0 {
                    let us = u32::try_from(us).unwrap_or(u32::MAX);
                    self.ctx.filters().set_irq_exit_threshold_us(us);
                    info!("exynos-snapshot: success {us} to threshold");
                }
            }
            "exlist_reg" => {
                let addr = parse_ulong_lenient(input) & !(REG_EXLIST_GRANULE - 1);
                info!("exynos-snapshot: register addr: {addr:#x}");
                if addr != 0 {
                    match self.ctx.filters().reg.push(addr, REG_EXLIST_GRANULE) {
                        Ok(()) => info!("exynos-snapshot: success {addr:#x} to list"),
                        Err(_) => warn!("exynos-snapshot: list is full"),
                    }
                }
            }
            _ => warn!("exynos-snapshot: no attribute {attr:?}"),
        }
        input.len()
    }

    fn store_enabled(&self, input: &str) {
        let name = input.trim_end_matches(['\n', '\0']).trim();
        match self.ctx.get_enable(name) {
            None => info!("exynos-snapshot: echo name > enabled"),
            Some(on) => {
                if let Err(e) = self.ctx.set_enable(name, !on) {
                    warn!("exynos-snapshot: cannot toggle {name}: {e}");
                }
            }
        }
    }

    fn store_irq(&self, input: &str, irq_exit: bool) {
        let irq = parse_ulong_lenient(input);
        info!("exynos-snapshot: irq number : {irq}");
        if irq == 0 {
            return;
        }
        let Ok(irq) = u32::try_from(irq) else {
            warn!("exynos-snapshot: irq {irq} out of range");
            return;
        };
        let list = if irq_exit {
            &self.ctx.filters().irq_exit
        } else {
            &self.ctx.filters().irq
        };
        match list.push(irq) {
            Ok(()) => info!("exynos-snapshot: success inserting {irq} to list"),
            Err(_) => warn!("exynos-snapshot: list is full"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::ContextBuilder;
    use crate::region::AnonymousReserver;

    fn boot() -> DiagnosticsContext {
        let mut cfg = Config::default();
        cfg.items.truncate(1);
        cfg.boot.minimized = true;
        cfg.categories.enabled = vec!["irq".into(), "irq_exit".into(), "reg".into()];
        ContextBuilder::new(cfg).boot(&mut AnonymousReserver::new(), Some("0x80000000"))
    }

    #[test]
    fn lenient_parse() {
        assert_eq!(parse_ulong_lenient("42\n"), 42);
        assert_eq!(parse_ulong_lenient("0x1f"), 31);
        assert_eq!(parse_ulong_lenient("017"), 15);
        assert_eq!(parse_ulong_lenient("12abc"), 12);
        assert_eq!(parse_ulong_lenient("junk"), 0);
        assert_eq!(parse_ulong_lenient(""), 0);
    }

    #[test]
    fn enabled_toggles_by_name() {
        let ctx = boot();
        let cs = ControlSurface::new(&ctx);
        let shown = cs.show("enabled").unwrap();
        assert!(shown.contains("log_kevents   : enable\n"));
        assert!(shown.contains("irq           : enable\n"));
        assert!(!shown.contains("task"));
        assert!(shown.ends_with("base          : enable\n"));

        assert_eq!(cs.store("enabled", "irq\n"), 4);
        assert_eq!(ctx.get_enable("irq"), Some(false));
        cs.store("enabled", "irq\n");
        assert_eq!(ctx.get_enable("irq"), Some(true));
        assert_eq!(cs.store("enabled", "bogus\n"), 6);
    }

    #[test]
    fn callstack_out_of_range_is_ignored() {
        let ctx = boot();
        let cs = ControlSurface::new(&ctx);
        assert_eq!(cs.store("callstack", "7"), 1);
        assert_eq!(ctx.callstack_depth(), 4);
        cs.store("callstack", "2\n");
        assert_eq!(cs.show("callstack").unwrap(), "callstack depth : 2\n");
    }

    #[test]
    fn irq_lists_fill_up() {
        let ctx = boot();
        let cs = ControlSurface::new(&ctx);
        cs.store("exlist_irqdisabled", "0");
        for irq in 100..110 {
            cs.store("exlist_irqdisabled", &format!("{irq}\n"));
        }
        assert_eq!(ctx.filters().irq.entries(), (100..108).collect::<Vec<_>>());
        let shown = cs.show("exlist_irqdisabled").unwrap();
        assert!(shown.starts_with("excluded irq number\nirq num: 100 \n"));

        cs.store("exlist_irqexit", "0x21");
        assert_eq!(cs.show("exlist_irqexit").unwrap(), "Excluded irq number\nIRQ num: 33  \n");
    }

    #[test]
    fn threshold_and_reg_list() {
        let ctx = boot();
        let cs = ControlSurface::new(&ctx);
        cs.store("threshold_irqexit", "0");
        assert_eq!(ctx.filters().irq_exit_threshold_us(), 300);
        cs.store("threshold_irqexit", "1000");
        assert_eq!(
            cs.show("threshold_irqexit").unwrap(),
            "threshold :         1000 us\n"
        );

        cs.store("exlist_reg", "0x10c01234");
        assert_eq!(
            cs.show("exlist_reg").unwrap(),
            "excluded register address\nregister addr: 10c01000 size: 00001000\n"
        );
        assert!(ctx.filters().reg.contains(0x10c0_1ffc));
    }

    #[test]
    fn unknown_attribute() {
        let ctx = boot();
        let cs = ControlSurface::new(&ctx);
        assert!(cs.show("nope").is_none());
        assert_eq!(cs.store("nope", "1"), 1);
        assert!(ATTRIBUTES.iter().all(|a| cs.show(a).is_some()));
    }
}
