use std::sync::Arc;

use exynos_ss::config::RegRange;
use exynos_ss::{
    AnonymousReserver, Config, ContextBuilder, DiagnosticsContext, Dumper, ManualClock, NoSymbols,
    SymbolTable,
};
use exynos_ss_common::{Category, IrqLog, PrintkLog, direction, str_from_bytes};

fn config(categories: &[&str]) -> Config {
    let mut cfg = Config::default();
    cfg.boot.nr_cpus = 2;
    cfg.boot.minimized = true;
    cfg.items.truncate(1);
    cfg.categories.enabled = categories.iter().map(|s| s.to_string()).collect();
    cfg
}

fn boot(cfg: Config, clock: Arc<ManualClock>) -> DiagnosticsContext {
    ContextBuilder::new(cfg)
        .clock(clock)
        .boot(&mut AnonymousReserver::new(), Some("0x90000000"))
}

#[test]
fn oldest_records_are_overwritten() {
    let mut cfg = config(&["task"]);
    cfg.categories.capacity.insert("task".into(), 8);
    let clock = Arc::new(ManualClock::new(0));
    let ctx = boot(cfg, clock.clone());

    for i in 0..10u64 {
        clock.set(i * 1000);
        ctx.task(0, 0x1000 + i, &format!("P{i}"));
    }

    let kevents = ctx.kevents().unwrap();
    assert_eq!(kevents.write_index(Category::Task, 0), Some(9));
    assert_eq!(kevents.write_index(Category::Task, 1), Some(-1));

    let mut dumper = Dumper::open(kevents, Category::Task, 0, &NoSymbols).unwrap();
    assert_eq!(dumper.init_idx(), 2);
    let lines: Vec<_> = dumper.by_ref().collect();
    let times: Vec<u64> = lines.iter().map(|l| l.time_ns).collect();
    assert_eq!(times, (2..10).map(|i| i * 1000).collect::<Vec<_>>());
    assert!(lines[0].text.starts_with("task:P2 "));
    assert!(lines[7].text.starts_with("task:P9 "));
    assert!(dumper.next().is_none());
    assert!(dumper.next().is_none());
}

#[test]
fn wrap_boundary() {
    let mut cfg = config(&["task"]);
    cfg.categories.capacity.insert("task".into(), 8);
    let clock = Arc::new(ManualClock::new(0));
    let ctx = boot(cfg, clock.clone());
    let kevents = ctx.kevents().unwrap();

    for i in 0..8u64 {
        clock.set(i + 1);
        ctx.task(0, i, "fill");
    }
    let dumper = Dumper::open(kevents, Category::Task, 0, &NoSymbols).unwrap();
    assert_eq!(dumper.init_idx(), 0);
    assert_eq!(dumper.count(), 8);

    clock.set(100);
    ctx.task(0, 8, "wrap");
    let mut dumper = Dumper::open(kevents, Category::Task, 0, &NoSymbols).unwrap();
    assert_eq!(dumper.init_idx(), 1);
    let last = dumper.by_ref().last().unwrap();
    assert_eq!(last.slot, 0);
    assert_eq!(last.time_ns, 100);
}

#[test]
fn partial_ring_skips_unwritten_slots() {
    let clock = Arc::new(ManualClock::new(5));
    let ctx = boot(config(&["task"]), clock);
    ctx.task(1, 1, "a");
    ctx.task(1, 2, "b");
    let kevents = ctx.kevents().unwrap();
    let lines: Vec<_> = Dumper::open(kevents, Category::Task, 1, &NoSymbols)
        .unwrap()
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].slot, 0);
    assert_eq!(lines[1].cpu, Some(1));
    assert_eq!(
        Dumper::open(kevents, Category::Task, 0, &NoSymbols)
            .unwrap()
            .count(),
        0
    );
}

#[test]
fn concurrent_writers_stay_on_their_own_cpu() {
    let mut cfg = config(&["irq"]);
    cfg.categories.capacity.insert("irq".into(), 1024);
    let ctx = boot(cfg, Arc::new(ManualClock::new(1)));

    std::thread::scope(|s| {
        for cpu in 0..2usize {
            let ctx = &ctx;
            s.spawn(move || {
                for i in 0..1000u32 {
                    let irq = cpu as u32 * 10_000 + i;
                    ctx.irq(cpu, irq, 0xffff_0000 + u64::from(irq), 0, 0, direction::IN);
                }
            });
        }
    });

    let kevents = ctx.kevents().unwrap();
    for cpu in 0..2usize {
        assert_eq!(kevents.write_index(Category::Irq, cpu), Some(999));
        for slot in 0..1000 {
            let rec: IrqLog = kevents.load(cpu, slot).unwrap();
            let irq = cpu as u32 * 10_000 + slot as u32;
            assert_eq!(rec.irq, irq);
            assert_eq!(rec.func, 0xffff_0000 + u64::from(irq));
        }
    }
    assert_eq!(ctx.stats().records(Category::Irq), 2000);
}

fn printk_from_two_cpus(ctx: &DiagnosticsContext, per_writer: u32) {
    std::thread::scope(|s| {
        for cpu in 0..2usize {
            s.spawn(move || {
                for i in 0..per_writer {
                    ctx.printk(cpu, format_args!("w{cpu}:{i}"), &[]);
                }
            });
        }
    });
}

#[test]
fn global_ring_hands_out_every_index_once() {
    let mut cfg = config(&["printk"]);
    cfg.categories.capacity.insert("printk".into(), 1024);
    let ctx = boot(cfg, Arc::new(ManualClock::new(1)));

    printk_from_two_cpus(&ctx, 500);

    let kevents = ctx.kevents().unwrap();
    assert_eq!(kevents.write_index(Category::Printk, 0), Some(999));
    let mut seen = [Vec::new(), Vec::new()];
    for slot in 0..1000 {
        let rec: PrintkLog = kevents.load(0, slot).unwrap();
        let text = str_from_bytes(&rec.log);
        let (writer, i) = text
            .strip_prefix('w')
            .and_then(|t| t.split_once(':'))
            .unwrap_or_else(|| panic!("slot {slot} holds {text:?}"));
        let writer: usize = writer.parse().unwrap();
        assert_eq!(rec.cpu as usize, writer, "slot {slot}");
        seen[writer].push(i.parse::<u32>().unwrap());
    }
    for indices in &mut seen {
        indices.sort_unstable();
        assert_eq!(*indices, (0..500).collect::<Vec<_>>());
    }
    assert_eq!(ctx.stats().records(Category::Printk), 1000);
}

#[test]
fn global_ring_wrap_tolerates_payload_overlap() {
    let mut cfg = config(&["printk"]);
    cfg.categories.capacity.insert("printk".into(), 64);
    let ctx = boot(cfg, Arc::new(ManualClock::new(7)));

    printk_from_two_cpus(&ctx, 2000);

    let kevents = ctx.kevents().unwrap();
    assert_eq!(kevents.write_index(Category::Printk, 0), Some(3999));
    assert_eq!(ctx.stats().records(Category::Printk), 4000);
    // Two writers may land on one slot once the ring wraps; the text of such a
    // slot can mix both payloads. Only fields both writers agree on are checked.
    for slot in 0..64 {
        let rec: PrintkLog = kevents.load(0, slot).unwrap();
        assert_eq!(rec.time, 7, "slot {slot}");
        assert!(rec.cpu < 2, "slot {slot} cpu {}", rec.cpu);
        assert_eq!(rec.log[0], b'w', "slot {slot}");
    }
}

#[test]
fn filtered_records_leave_the_index_alone() {
    let mut cfg = config(&["irq", "irq_exit", "reg"]);
    cfg.filters.irq_exclude = vec![7];
    cfg.filters.irq_exit_exclude = vec![9];
    cfg.filters.reg_exclude = vec![RegRange {
        addr: 0x1000_0000,
        size: 0x1000,
    }];
    let clock = Arc::new(ManualClock::new(1_000_000));
    let ctx = boot(cfg, clock);
    let kevents = ctx.kevents().unwrap();

    ctx.irq(0, 7, 0, 0, 0, direction::IN);
    assert_eq!(kevents.write_index(Category::Irq, 0), Some(-1));
    ctx.irq(0, 8, 0, 0, 0, direction::IN);
    assert_eq!(kevents.write_index(Category::Irq, 0), Some(0));

    ctx.irq_exit(0, 9, 0);
    ctx.irq_exit(0, 5, 1_000_000 - 50_000);
    ctx.irq_exit(0, 5, 1_000_000 - 300_000);
    assert_eq!(kevents.write_index(Category::IrqExit, 0), Some(-1));
    ctx.irq_exit(0, 5, 1_000_000 - 300_001);
    assert_eq!(kevents.write_index(Category::IrqExit, 0), Some(0));
    assert_eq!(ctx.stats().below_threshold(), 2);

    ctx.reg(0, true, 0x1000_0ffc, 1, direction::IN, &[]);
    assert_eq!(kevents.write_index(Category::Reg, 0), Some(-1));
    ctx.reg(0, true, 0x1000_1000, 1, direction::IN, &[]);
    assert_eq!(kevents.write_index(Category::Reg, 0), Some(0));

    assert_eq!(ctx.stats().filtered(), 3);
}

#[test]
fn switched_off_category_records_nothing() {
    let ctx = boot(config(&["task", "irq"]), Arc::new(ManualClock::new(1)));
    let kevents = ctx.kevents().unwrap();
    ctx.set_enable("task", false).unwrap();
    ctx.task(0, 1, "off");
    ctx.irq(0, 1, 0, 0, 0, direction::IN);
    assert_eq!(kevents.write_index(Category::Task, 0), Some(-1));
    assert_eq!(kevents.write_index(Category::Irq, 0), Some(0));

    ctx.set_enable("base", false).unwrap();
    ctx.irq(0, 1, 0, 0, 0, direction::IN);
    assert_eq!(kevents.write_index(Category::Irq, 0), Some(0));
}

#[test]
fn irq_line_with_symbols() {
    let clock = Arc::new(ManualClock::new(12_345_678_901));
    let ctx = boot(config(&["irq"]), clock);
    ctx.irq(0, 42, 0xffff_ff80_0810_0010, 0, 0, direction::IN);

    let symbols = SymbolTable::new(vec![(0xffff_ff80_0810_0000, "gic_handle_irq".into())]);
    let line = Dumper::open(ctx.kevents().unwrap(), Category::Irq, 0, &symbols)
        .unwrap()
        .next()
        .unwrap();
    assert_eq!(
        line.to_string(),
        "[     12.345678901][0000:CPU0]           irq:  IN: irq:42 gic_handle_irq+0x10 preempt:0x0 val:0x0"
    );

    let raw = Dumper::open(ctx.kevents().unwrap(), Category::Irq, 0, &NoSymbols)
        .unwrap()
        .next()
        .unwrap();
    assert!(raw.text.contains("0xffffff8008100010"));
}
