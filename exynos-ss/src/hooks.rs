//! Console and logger mirrors into the byte-ring items.
//!
//! `log_kernel` receives raw console text; `log_platform` receives Android
//! logger records reassembled from pmsg writes. Both wrap to the item head
//! when a write would run past the end.

use std::sync::atomic::Ordering;

use chrono::DateTime;

use crate::config::{KERNEL_ITEM, KEVENTS_ITEM, PLATFORM_ITEM};
use crate::context::DiagnosticsContext;
use crate::layout::Item;

const PMSG_HEADER_LEN: usize = 7;
const LOG_HEADER_LEN: usize = 11;
const PMSG_MAGIC: u8 = b'l';
const LOG_ID_EVENTS: u8 = 2;
const LOG_ID_MAX: u8 = 7;
const PRIO_CHARS: &[u8] = b"!.VDIWEFS";
const HEADER_LINE_MAX: usize = 67;
/// A four byte chunk not ending in NUL is a length word, not text.
const SKIP_COUNT: usize = 4;

/// Reassembly state for the pmsg chunk sequence
/// (pmsg header, log header, priority byte, text).
#[derive(Debug, Default)]
pub(crate) struct PmsgLogger {
    pid: u16,
    uid: u16,
    len: u16,
    id: u8,
    tid: u16,
    tv_sec: i32,
    tv_nsec: i32,
}

impl DiagnosticsContext {
    /// Copy `bytes` at the item's cursor, restarting at the head when they
    /// would not fit. Returns the new cursor.
    fn append(&self, item: &Item, bytes: &[u8]) -> Option<usize> {
        if bytes.is_empty() || !self.is_enabled() || !item.enabled() {
            return None;
        }
        let raw = self.item_raw(item)?;
        let size = item.size;
        let bytes = &bytes[bytes.len().saturating_sub(size)..];

        let mut cur = item.cursor.load(Ordering::Relaxed);
        let (start, next) = loop {
            let start = if cur + bytes.len() > size { 0 } else { cur };
            let mut next = start + bytes.len();
            if next == size {
                next = 0;
            }
            match item
                .cursor
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break (start, next),
                Err(actual) => cur = actual,
            }
        };
        raw.copy_from(start, bytes);
        self.stats.add_hook_bytes(bytes.len());
        Some(next)
    }

    /// Mirror console text into `log_kernel` and remember where it ends.
    pub fn hook_logbuf(&self, bytes: &[u8]) {
        let Some(item) = self.item(KERNEL_ITEM) else {
            return;
        };
        if let Some(cursor) = self.append(item, bytes) {
            if let Some(hdr) = self.live_header() {
                hdr.set_last_logbuf(item.paddr + cursor as u64);
            }
        }
    }

    /// Mirror `bytes` into the byte-ring item called `name`.
    pub fn hook_logger(&self, name: &str, bytes: &[u8]) {
        if name == KEVENTS_ITEM {
            return;
        }
        if let Some(item) = self.item(name) {
            self.append(item, bytes);
        }
    }

    /// One pmsg write from `comm` on `cpu`. Android writes each log entry as
    /// a pmsg header, a log header, a priority byte and then the text; chunks
    /// are told apart by their size.
    pub fn hook_pmsg(&self, cpu: usize, comm: &str, bytes: &[u8]) {
        let mut logger = self.pmsg.lock().unwrap_or_else(|e| e.into_inner());
        match bytes.len() {
            PMSG_HEADER_LEN => {
                if bytes[0] != PMSG_MAGIC {
                    self.pmsg_text(&logger, bytes);
                } else {
                    logger.len = u16::from_le_bytes([bytes[1], bytes[2]]);
                    logger.uid = u16::from_le_bytes([bytes[3], bytes[4]]);
                    logger.pid = u16::from_le_bytes([bytes[5], bytes[6]]);
                }
            }
            LOG_HEADER_LEN => {
                logger.id = bytes[0];
                logger.tid = u16::from_le_bytes([bytes[1], bytes[2]]);
                logger.tv_sec = i32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
                logger.tv_nsec = i32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
                if logger.id > LOG_ID_MAX {
                    self.pmsg_text(&logger, bytes);
                } else {
                    self.pmsg_header(&logger, cpu, comm);
                }
            }
            1 => {
                if logger.id == LOG_ID_EVENTS {
                    return;
                }
                let prio = PRIO_CHARS.get(bytes[0] as usize).copied().unwrap_or(b'?');
                self.hook_logger(PLATFORM_ITEM, &[prio, b' ']);
            }
            _ => self.pmsg_text(&logger, bytes),
        }
    }

    fn pmsg_header(&self, logger: &PmsgLogger, cpu: usize, comm: &str) {
        if logger.id == LOG_ID_EVENTS {
            return;
        }
        let now = self.clock.cpu_clock(cpu);
        let stamp = DateTime::from_timestamp(i64::from(logger.tv_sec), 0)
            .map(|t| t.format("%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "00-00 00:00:00".to_string());
        let mut line = format!(
            "\n[{:5}.{:06}][{}:{:>16}] {}.{:03} {:5} {:5} ",
            now / 1_000_000_000,
            (now % 1_000_000_000) / 1000,
            cpu,
            comm,
            stamp,
            logger.tv_nsec / 1_000_000,
            logger.pid,
            logger.tid
        );
        line.truncate(HEADER_LINE_MAX);
        self.hook_logger(PLATFORM_ITEM, line.as_bytes());
    }

    fn pmsg_text(&self, logger: &PmsgLogger, bytes: &[u8]) {
        if logger.id == LOG_ID_EVENTS || bytes.is_empty() {
            return;
        }
        if bytes.len() == SKIP_COUNT && bytes[SKIP_COUNT - 1] != 0 {
            return;
        }
        // trailing NUL
        self.hook_logger(PLATFORM_ITEM, &bytes[..bytes.len() - 1]);
    }

    /// Bytes of a byte-ring item from its head up to the write cursor.
    pub fn mirrored(&self, name: &str) -> Option<Vec<u8>> {
        let item = self.item(name)?;
        let raw = self.item_raw(item)?;
        let mut out = vec![0u8; item.cursor()];
        raw.copy_to(0, &mut out);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::config::{Config, ItemConfig};
    use crate::context::ContextBuilder;
    use crate::region::AnonymousReserver;

    fn boot() -> DiagnosticsContext {
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
                name: KERNEL_ITEM.into(),
                size: 4096,
                persist: false,
                enabled: true,
            },
            ItemConfig {
                name: PLATFORM_ITEM.into(),
                size: 4096,
                persist: false,
                enabled: true,
            },
        ];
        ContextBuilder::new(cfg)
            .clock(Arc::new(ManualClock::new(3_000_250_000)))
            .boot(&mut AnonymousReserver::new(), Some("0x80000000"))
    }

    #[test]
    fn logbuf_wraps_and_tracks_last_pointer() {
        let ctx = boot();
        let kernel = ctx.item(KERNEL_ITEM).unwrap().paddr;
        ctx.hook_logbuf(&[b'a'; 3000]);
        assert_eq!(ctx.header().unwrap().last_logbuf(), kernel + 3000);
        ctx.hook_logbuf(&[b'b'; 2000]);
        assert_eq!(ctx.mirrored(KERNEL_ITEM).unwrap(), vec![b'b'; 2000]);
        assert_eq!(ctx.header().unwrap().last_logbuf(), kernel + 2000);
        ctx.hook_logbuf(&[b'c'; 2096]);
        assert_eq!(ctx.header().unwrap().last_logbuf(), kernel);
        assert_eq!(ctx.stats().hook_bytes(), 7096);
    }

    #[test]
    fn disabled_item_is_not_written() {
        let ctx = boot();
        ctx.set_enable(KERNEL_ITEM, false).unwrap();
        ctx.hook_logbuf(b"lost");
        assert_eq!(ctx.mirrored(KERNEL_ITEM).unwrap(), b"");
    }

    #[test]
    fn logger_never_touches_kevents() {
        let ctx = boot();
        ctx.hook_logger(KEVENTS_ITEM, b"boom");
        assert_eq!(ctx.stats().hook_bytes(), 0);
        ctx.hook_logger(PLATFORM_ITEM, b"ok");
        assert_eq!(ctx.mirrored(PLATFORM_ITEM).unwrap(), b"ok");
    }

    fn pmsg_header(pid: u16) -> Vec<u8> {
        let mut v = vec![PMSG_MAGIC];
        v.extend_from_slice(&32u16.to_le_bytes());
        v.extend_from_slice(&1000u16.to_le_bytes());
        v.extend_from_slice(&pid.to_le_bytes());
        v
    }

    fn log_header(id: u8, tid: u16) -> Vec<u8> {
        let mut v = vec![id];
        v.extend_from_slice(&tid.to_le_bytes());
        // 2021-03-04 05:06:07 UTC
        v.extend_from_slice(&1_614_834_367i32.to_le_bytes());
        v.extend_from_slice(&89_000_000i32.to_le_bytes());
        v
    }

    #[test]
    fn pmsg_sequence_builds_a_log_line() {
        let ctx = boot();
        ctx.hook_pmsg(0, "logd", &pmsg_header(321));
        ctx.hook_pmsg(0, "logd", &log_header(0, 654));
        ctx.hook_pmsg(0, "logd", &[4]);
        ctx.hook_pmsg(0, "logd", b"ActivityManager: start\0");
        let text = String::from_utf8(ctx.mirrored(PLATFORM_ITEM).unwrap()).unwrap();
        assert_eq!(
            text,
            "\n[    3.000250][0:            logd] 03-04 05:06:07.089   321   654 \
             I ActivityManager: start"
        );
    }

    #[test]
    fn event_records_are_dropped() {
        let ctx = boot();
        ctx.hook_pmsg(0, "logd", &pmsg_header(1));
        ctx.hook_pmsg(0, "logd", &log_header(LOG_ID_EVENTS, 1));
        ctx.hook_pmsg(0, "logd", &[4]);
        ctx.hook_pmsg(0, "logd", b"binary payload\0");
        assert_eq!(ctx.mirrored(PLATFORM_ITEM).unwrap(), b"");
    }

    #[test]
    fn length_word_is_skipped() {
        let ctx = boot();
        ctx.hook_pmsg(0, "logd", &[1, 2, 3, 4]);
        ctx.hook_pmsg(0, "logd", b"ab\0\0");
        assert_eq!(ctx.mirrored(PLATFORM_ITEM).unwrap(), b"ab\0");
    }
}
