use std::sync::Arc;
use std::time::Duration;

use exynos_ss::config::KERNEL_ITEM;
use exynos_ss::{
    AnonymousReserver, CaptureOutcome, Config, ContextBuilder, FileReserver, ManualClock,
    SnapshotImage,
};
use exynos_ss_common::{Category, CoreRegisters, direction, sign};

fn small_config() -> Config {
    let mut cfg = Config::default();
    cfg.boot.nr_cpus = 2;
    cfg.boot.minimized = true;
    cfg.items.truncate(2);
    cfg.items[1].size = 4096;
    cfg
}

#[test]
fn reservation_failure_disables_everything() {
    let ctx = ContextBuilder::new(small_config())
        .boot(&mut AnonymousReserver::with_limit(4096), Some("0x90000000"));
    assert!(!ctx.is_enabled());
    assert!(ctx.kevents().is_none());
    assert!(ctx.item_paddr(KERNEL_ITEM).is_none());

    ctx.task(0, 1, "init");
    ctx.irq(0, 1, 0, 0, 0, direction::IN);
    ctx.hook_logbuf(b"lost\n");
    assert_eq!(ctx.stats().records_total(), 0);
    assert_eq!(ctx.save_context(0, None), CaptureOutcome::Disabled);
    assert!(ctx.set_enable("base", true).is_err());
    assert!(!ctx.try_enable("base", Duration::from_secs(1)));
}

#[test]
fn missing_base_address_disables_everything() {
    let ctx = ContextBuilder::new(small_config()).boot(&mut AnonymousReserver::new(), None);
    assert!(!ctx.is_enabled());
}

#[test]
fn second_capture_on_a_cpu_is_skipped() {
    let ctx = ContextBuilder::new(small_config())
        .boot(&mut AnonymousReserver::new(), Some("0x90000000"));
    let first = CoreRegisters {
        pc: 0x1111,
        ..Default::default()
    };
    let second = CoreRegisters {
        pc: 0x2222,
        ..Default::default()
    };

    assert_eq!(ctx.save_context(0, Some(&first)), CaptureOutcome::Captured);
    assert_eq!(ctx.save_context(0, Some(&second)), CaptureOutcome::Skipped);
    assert_eq!(ctx.save_context(1, Some(&second)), CaptureOutcome::Captured);

    let hdr = ctx.header().unwrap();
    assert_eq!(hdr.core_registers(0).pc, 0x1111);
    assert_eq!(hdr.core_registers(1).pc, 0x2222);
    assert_eq!(hdr.core_panic_stat(0), sign::PANIC);
    assert_eq!(ctx.stats().captures(), 2);
    assert_eq!(ctx.stats().captures_skipped(), 1);

    ctx.post_reboot(0);
    assert_eq!(hdr.core_panic_stat(0), sign::PANIC);
    assert_eq!(hdr.core_panic_stat(1), sign::RESET);
    assert_ne!(hdr.core_registers(0).pc, 0x1111);
    assert_eq!(hdr.emergency_reason(), sign::NORMAL_REBOOT);
    assert_eq!(ctx.stats().captures(), 3);
}

#[test]
fn console_mirror_resumes_after_warm_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ess.img");

    {
        let ctx = ContextBuilder::new(small_config())
            .boot(&mut FileReserver::new(&path), Some("0x90000000"));
        ctx.hook_logbuf(b"first boot\n");
        let kernel = ctx.item_paddr(KERNEL_ITEM).unwrap();
        assert_eq!(ctx.header().unwrap().last_logbuf(), kernel + 11);
    }

    let ctx = ContextBuilder::new(small_config())
        .boot(&mut FileReserver::new(&path), Some("0x90000000"));
    ctx.hook_logbuf(b"second boot\n");
    assert_eq!(
        ctx.mirrored(KERNEL_ITEM).unwrap(),
        b"first boot\nsecond boot\n".to_vec()
    );
}

#[test]
fn rings_start_empty_after_warm_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ess.img");
    let clock = Arc::new(ManualClock::new(7));

    {
        let ctx = ContextBuilder::new(small_config())
            .clock(clock.clone())
            .boot(&mut FileReserver::new(&path), Some("0x90000000"));
        ctx.task(0, 1, "before");
        ctx.dump_panic("Oops");
        ctx.report_reason(sign::PANIC);
    }

    let image = SnapshotImage::open(&path).unwrap();
    assert_eq!(image.status().reason, "PANIC");
    assert_eq!(image.kevents().unwrap().write_index(Category::Task, 0), Some(0));
    drop(image);

    let ctx = ContextBuilder::new(small_config())
        .clock(clock)
        .boot(&mut FileReserver::new(&path), Some("0x90000000"));
    let kevents = ctx.kevents().unwrap();
    assert_eq!(kevents.write_index(Category::Task, 0), Some(-1));
    assert_eq!(ctx.header().unwrap().scratch(), sign::SCRATCH);
}
