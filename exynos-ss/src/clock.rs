use std::sync::atomic::{AtomicU64, Ordering};

/// Timestamp source for records. Must be monotonic and cheap; never wall clock.
pub trait Clock: Send + Sync {
    /// Nanoseconds on the given CPU's clock.
    fn cpu_clock(&self, cpu: usize) -> u64;
}

/// `CLOCK_BOOTTIME`, so time spent in suspend is still counted.
#[derive(Debug, Default, Clone, Copy)]
pub struct BootClock;

impl Clock for BootClock {
    #[inline]
    fn cpu_clock(&self, _cpu: usize) -> u64 {
        use nix::time::{ClockId, clock_gettime};
        match clock_gettime(ClockId::CLOCK_BOOTTIME) {
            Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64),
            Err(_) => 0,
        }
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::Relaxed);
    }

    pub fn advance(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn cpu_clock(&self, _cpu: usize) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}
