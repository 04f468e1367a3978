//! Ramoops carve-out over the `log_pstore` item.

use serde::Serialize;

use crate::config::PSTORE_ITEM;
use crate::context::DiagnosticsContext;

const ZONE_SIZE: u64 = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RamoopsLayout {
    pub mem_address: u64,
    pub mem_size: u64,
    pub record_size: u64,
    pub console_size: u64,
    pub ftrace_size: u64,
    pub pmsg_size: u64,
    pub dump_oops: u32,
}

impl DiagnosticsContext {
    /// Parameters for registering ramoops over `log_pstore`, or `None` when
    /// the item is not placed.
    pub fn pstore_layout(&self) -> Option<RamoopsLayout> {
        if !self.is_enabled() {
            return None;
        }
        Some(RamoopsLayout {
            mem_address: self.item_paddr(PSTORE_ITEM)?,
            mem_size: self.item_size(PSTORE_ITEM)? as u64,
            record_size: ZONE_SIZE,
            console_size: ZONE_SIZE,
            ftrace_size: ZONE_SIZE,
            pmsg_size: ZONE_SIZE,
            dump_oops: 1,
        })
    }
}
