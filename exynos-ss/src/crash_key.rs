//! Forced upload key sequence: hold volume-down (not volume-up), press power
//! twice.

use log::info;

use crate::context::DiagnosticsContext;

pub const KEY_VOLUMEDOWN: u32 = 114;
pub const KEY_VOLUMEUP: u32 = 115;
pub const KEY_POWER: u32 = 116;

const PRESSES_TO_PANIC: u32 = 2;

#[derive(Debug, Default)]
pub struct CrashKey {
    volup: bool,
    voldown: bool,
    count: u32,
}

impl CrashKey {
    /// Feed one key event. Returns `true` when the sequence is complete and
    /// the caller should panic.
    pub fn check(&mut self, code: u32, pressed: bool) -> bool {
        if code == KEY_POWER {
            info!(
                "exynos-snapshot: POWER-KEY {}",
                if pressed { "pressed" } else { "released" }
            );
        }
        if !pressed {
            match code {
                KEY_VOLUMEUP => self.volup = false,
                KEY_VOLUMEDOWN => {
                    self.voldown = false;
                    self.count = 0;
                }
                _ => {}
            }
            return false;
        }

        match code {
            KEY_VOLUMEUP => self.volup = true,
            KEY_VOLUMEDOWN => self.voldown = true,
            _ => {}
        }
        if code == KEY_POWER && self.voldown && !self.volup {
            self.count += 1;
            info!(
                "exynos-snapshot: count for entering forced upload [{}]",
                self.count
            );
            return self.count == PRESSES_TO_PANIC;
        }
        false
    }
}

impl DiagnosticsContext {
    /// Input hook for the crash key sequence.
    pub fn check_crash_key(&self, code: u32, pressed: bool) -> bool {
        self.crash_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check(code, pressed)
    }
}
